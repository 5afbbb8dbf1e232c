//! Shared fakes for integration tests: an in-memory terminal backend and a
//! locator mapping working directories to its panes.

#![allow(dead_code)]

use askd::daemon::worker::WorkerSettings;
use askd::error::{AskError, Result};
use askd::session::{session_key, SessionBinding, SessionLocator};
use askd::terminal::TerminalBackend;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

type Responder = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One `send_text` call as seen by the fake
#[derive(Debug, Clone)]
pub struct SentPrompt {
    pub pane: String,
    pub message: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Fake multiplexer: answers each prompt on the same pane with
/// `BEGIN:<id>` / reply / `DONE:<id>` unless the responder returns `None`.
pub struct FakeTerminal {
    screens: Mutex<HashMap<String, String>>,
    dead: Mutex<Vec<String>>,
    sends: Mutex<Vec<SentPrompt>>,
    send_delay: Duration,
    responder: Responder,
}

impl FakeTerminal {
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self::with_send_delay(Duration::ZERO, responder)
    }

    pub fn with_send_delay<F>(send_delay: Duration, responder: F) -> Arc<Self>
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Arc::new(Self {
            screens: Mutex::new(HashMap::new()),
            dead: Mutex::new(Vec::new()),
            sends: Mutex::new(Vec::new()),
            send_delay,
            responder: Box::new(responder),
        })
    }

    /// `"ping"` gets `"pong"`, `"hang"` never completes, anything else is echoed
    pub fn pong() -> Arc<Self> {
        Self::new(ping_responder)
    }

    pub fn kill(&self, pane: &str) {
        self.dead.lock().unwrap().push(pane.to_string());
    }

    pub fn revive(&self, pane: &str) {
        self.dead.lock().unwrap().retain(|p| p != pane);
    }

    pub fn sends(&self) -> Vec<SentPrompt> {
        self.sends.lock().unwrap().clone()
    }
}

pub fn ping_responder(message: &str) -> Option<String> {
    match message {
        "ping" => Some("pong".to_string()),
        "hang" => None,
        other => Some(format!("echo: {}", other)),
    }
}

/// Split a wrapped prompt into its request id and message
fn parse_prompt(text: &str) -> (String, String) {
    let (header, rest) = text.split_once('\n').unwrap_or((text, ""));
    let id = header
        .trim()
        .trim_start_matches("[askd request ")
        .trim_end_matches(']')
        .to_string();
    let message = rest
        .split_once("\n\nReply format")
        .map(|(message, _)| message)
        .unwrap_or(rest)
        .to_string();
    (id, message)
}

impl TerminalBackend for FakeTerminal {
    fn name(&self) -> &str {
        "fake"
    }

    fn activate(&self, _pane: &str) -> Result<()> {
        Ok(())
    }

    fn send_text(&self, pane: &str, text: &str) -> Result<()> {
        if !self.is_alive(pane) {
            return Err(AskError::backend(format!("no pane {}", pane)));
        }
        let started = Instant::now();
        if !self.send_delay.is_zero() {
            thread::sleep(self.send_delay);
        }

        let (id, message) = parse_prompt(text);
        let mut screens = self.screens.lock().unwrap();
        let screen = screens.entry(pane.to_string()).or_default();
        screen.push_str(text);
        screen.push('\n');
        if let Some(reply) = (self.responder)(&message) {
            screen.push_str(&format!("BEGIN:{id}\n{reply}\nDONE:{id}\n"));
        }
        drop(screens);

        self.sends.lock().unwrap().push(SentPrompt {
            pane: pane.to_string(),
            message,
            started,
            finished: Instant::now(),
        });
        Ok(())
    }

    fn capture_text(&self, pane: &str, _max_lines: usize) -> Result<String> {
        if !self.is_alive(pane) {
            return Err(AskError::backend(format!("no pane {}", pane)));
        }
        Ok(self.screens.lock().unwrap().get(pane).cloned().unwrap_or_default())
    }

    fn is_alive(&self, pane: &str) -> bool {
        !self.dead.lock().unwrap().iter().any(|p| p == pane)
    }
}

/// Locator with a fixed working-directory → pane table
pub struct MapLocator {
    backend: Arc<FakeTerminal>,
    panes: HashMap<PathBuf, String>,
}

impl MapLocator {
    pub fn new(backend: Arc<FakeTerminal>) -> Self {
        Self {
            backend,
            panes: HashMap::new(),
        }
    }

    pub fn bind(mut self, work_dir: impl Into<PathBuf>, pane: &str) -> Self {
        self.panes.insert(work_dir.into(), pane.to_string());
        self
    }
}

impl SessionLocator for MapLocator {
    fn locate(&self, provider: &str, work_dir: &Path) -> Result<Option<SessionBinding>> {
        Ok(self.panes.get(work_dir).map(|pane| SessionBinding {
            backend: self.backend.clone(),
            pane: pane.clone(),
            session_file: work_dir.join(format!(".{}-session", provider)),
            session_key: session_key(provider, work_dir),
        }))
    }
}

/// Fast polling for tests
pub fn fast_settings() -> WorkerSettings {
    WorkerSettings {
        poll_interval: Duration::from_millis(10),
        liveness_interval: Duration::from_millis(30),
        quiet_threshold: Duration::ZERO,
        startup_grace: Duration::ZERO,
        capture_lines: 400,
    }
}

/// Write an active session file for `provider` into `dir`
pub fn write_session_file(dir: &Path, provider: &str, pane: &str) -> PathBuf {
    let path = dir.join(format!(".{}-session", provider));
    std::fs::write(
        &path,
        format!(r#"{{"pane_id":"{}","terminal":"fake","active":true}}"#, pane),
    )
    .unwrap();
    path
}
