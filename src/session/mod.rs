//! Session binding: which pane serves a (provider, working directory) pair
//!
//! A bound working directory holds a small JSON session file
//! (`.codex-session`, `.gemini-session`, ...) written by whatever launched
//! the agent pane:
//!
//! ```json
//! {"pane_id": "%3", "terminal": "tmux", "work_dir": "/src/app", "active": true}
//! ```
//!
//! The daemon resolves sessions through the [`SessionLocator`] trait so tests
//! and other hosts can supply their own registry.

use crate::error::{AskError, Result};
use crate::provider::ProviderSpec;
use crate::terminal::{PaneId, TerminalBackend};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A resolved session: the backend and pane to drive
#[derive(Clone)]
pub struct SessionBinding {
    pub backend: Arc<dyn TerminalBackend>,
    pub pane: PaneId,
    pub session_file: PathBuf,
    pub session_key: String,
}

impl fmt::Debug for SessionBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBinding")
            .field("backend", &self.backend.name())
            .field("pane", &self.pane)
            .field("session_file", &self.session_file)
            .field("session_key", &self.session_key)
            .finish()
    }
}

/// Maps a (provider, working directory) pair to a session
pub trait SessionLocator: Send + Sync {
    /// Identity under which requests for this pair are serialized
    fn session_key(&self, provider: &str, work_dir: &Path) -> String {
        session_key(provider, work_dir)
    }

    /// Resolve the live binding, or `None` when no active session exists
    fn locate(&self, provider: &str, work_dir: &Path) -> Result<Option<SessionBinding>>;
}

/// Hash identifying a project directory (first 16 hex chars of sha256).
///
/// The path is canonicalized first, so a symlink and its target share an
/// identity. Case is preserved: `/src/App` and `/src/app` differ unless the
/// filesystem itself folds them to the same canonical path.
pub fn project_hash(work_dir: &Path) -> String {
    let canonical = fs::canonicalize(work_dir).unwrap_or_else(|_| work_dir.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    crate::codec::hex_encode(&digest[..8])
}

/// Default session key: `<provider>:<project hash>`
pub fn session_key(provider: &str, work_dir: &Path) -> String {
    format!("{}:{}", provider.to_lowercase(), project_hash(work_dir))
}

/// On-disk session descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFile {
    pub pane_id: String,
    #[serde(default = "default_terminal")]
    pub terminal: String,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_terminal() -> String {
    "tmux".to_string()
}

fn default_active() -> bool {
    true
}

impl SessionFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| AskError::InvalidSessionFile {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Find the provider's session file in `work_dir` or one of its ancestors
pub fn find_session_file(spec: &ProviderSpec, work_dir: &Path) -> Option<PathBuf> {
    work_dir
        .ancestors()
        .map(|dir| dir.join(&spec.session_filename))
        .find(|candidate| candidate.is_file())
}

/// Load a session file and keep it only if it is marked active
pub fn load_active_session(path: &Path) -> Option<SessionFile> {
    SessionFile::load(path).ok().filter(|session| session.active)
}

/// Locator backed by session files on disk
pub struct FileSessionLocator {
    backends: HashMap<String, Arc<dyn TerminalBackend>>,
    overrides: HashMap<String, PathBuf>,
}

impl FileSessionLocator {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            overrides: HashMap::new(),
        }
    }

    /// Register a backend under its name (`tmux`)
    pub fn with_backend(mut self, backend: Arc<dyn TerminalBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    /// Pin the session file used for a provider instead of searching
    pub fn with_session_file(mut self, provider: &str, path: PathBuf) -> Self {
        self.overrides.insert(provider.to_lowercase(), path);
        self
    }

    fn session_path(&self, provider: &str, work_dir: &Path) -> Option<PathBuf> {
        if let Some(path) = self.overrides.get(&provider.to_lowercase()) {
            return Some(path.clone());
        }
        find_session_file(&ProviderSpec::for_name(provider), work_dir)
    }
}

impl Default for FileSessionLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLocator for FileSessionLocator {
    /// Keyed by the directory holding the session file, so every
    /// subdirectory bound to the same pane shares one key
    fn session_key(&self, provider: &str, work_dir: &Path) -> String {
        match self.session_path(provider, work_dir) {
            Some(path) => session_key(provider, path.parent().unwrap_or(work_dir)),
            None => session_key(provider, work_dir),
        }
    }

    fn locate(&self, provider: &str, work_dir: &Path) -> Result<Option<SessionBinding>> {
        let Some(path) = self.session_path(provider, work_dir) else {
            return Ok(None);
        };
        let Some(session) = load_active_session(&path) else {
            return Ok(None);
        };

        let backend = self.backends.get(&session.terminal).cloned().ok_or_else(|| {
            AskError::backend(format!("unsupported terminal '{}' in {}", session.terminal, path.display()))
        })?;

        Ok(Some(SessionBinding {
            backend,
            pane: session.pane_id,
            session_file: path,
            session_key: self.session_key(provider, work_dir),
        }))
    }
}
