//! Terminal backend capability and the tmux driver
//!
//! The daemon only talks to panes through [`TerminalBackend`]. Tests plug in
//! fakes; the binaries use [`TmuxBackend`].

use crate::error::{AskError, Result};
use std::io::Write;
use std::process::{Command, Stdio};

/// Addressable pane identifier as understood by the backend (`%3` for tmux)
pub type PaneId = String;

/// Operations the core needs from a terminal multiplexer
pub trait TerminalBackend: Send + Sync {
    /// Backend name as written in session files (`tmux`)
    fn name(&self) -> &str;

    /// Bring the pane to the foreground
    fn activate(&self, pane: &str) -> Result<()>;

    /// Type `text` into the pane and submit it
    fn send_text(&self, pane: &str, text: &str) -> Result<()>;

    /// Return the last `max_lines` lines of the pane
    fn capture_text(&self, pane: &str, max_lines: usize) -> Result<String>;

    /// Whether the pane exists and its process is still running
    fn is_alive(&self, pane: &str) -> bool;
}

/// Drives panes through the `tmux` command line
#[derive(Debug, Clone)]
pub struct TmuxBackend {
    program: String,
    socket: Option<String>,
}

impl TmuxBackend {
    pub fn new() -> Self {
        Self {
            program: "tmux".to_string(),
            socket: std::env::var("ASK_TMUX_SOCKET").ok().filter(|s| !s.is_empty()),
        }
    }

    /// Use a specific tmux socket name (`tmux -L <name>`)
    pub fn with_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(ref socket) = self.socket {
            cmd.arg("-L").arg(socket);
        }
        cmd
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = self.command();
        cmd.args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| AskError::backend(format!("failed to run tmux: {}", e)))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .map_err(|e| AskError::backend(format!("failed to write to tmux: {}", e)))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| AskError::backend(format!("tmux did not finish: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AskError::backend(format!(
                "tmux {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for TmuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalBackend for TmuxBackend {
    fn name(&self) -> &str {
        "tmux"
    }

    fn activate(&self, pane: &str) -> Result<()> {
        self.run(&["select-pane", "-t", pane], None).map(|_| ())
    }

    fn send_text(&self, pane: &str, text: &str) -> Result<()> {
        // Paste through a named buffer so multi-line prompts arrive intact.
        let buffer = format!("askd-{}", pane.trim_start_matches('%'));
        self.run(&["load-buffer", "-b", &buffer, "-"], Some(text))?;
        self.run(&["paste-buffer", "-p", "-d", "-b", &buffer, "-t", pane], None)?;
        self.run(&["send-keys", "-t", pane, "Enter"], None).map(|_| ())
    }

    fn capture_text(&self, pane: &str, max_lines: usize) -> Result<String> {
        let start = format!("-{}", max_lines.max(1));
        self.run(&["capture-pane", "-p", "-J", "-t", pane, "-S", &start], None)
    }

    fn is_alive(&self, pane: &str) -> bool {
        match self.run(&["display-message", "-p", "-t", pane, "#{pane_dead}"], None) {
            Ok(out) => out.trim() == "0",
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_tmux_binary_is_backend_error() {
        let backend = TmuxBackend {
            program: "/nonexistent/askd-tmux".to_string(),
            socket: None,
        };
        let err = backend.capture_text("%1", 10).unwrap_err();
        assert_eq!(err.error_code(), "BACKEND_ERROR");
        assert!(!backend.is_alive("%1"));
    }

    #[test]
    fn test_socket_is_passed_first() {
        let backend = TmuxBackend::new().with_socket("askd-test");
        let cmd = backend.command();
        let args: Vec<_> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, vec!["-L", "askd-test"]);
    }
}
