//! Per-provider daemon state file
//!
//! `{host, port, token, pid, started_at}` written atomically when the server binds and
//! read by every client before connecting. Only the process whose pid is
//! recorded may remove it, so a daemon shutting down late never deletes the
//! file of a newer daemon that replaced it.

use crate::error::Result;
use crate::persist;
use crate::provider::ProviderSpec;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub pid: u32,
    /// RFC 3339 start time; older state files omit it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

impl DaemonState {
    /// Default location: `<cache dir>/askd/<provider>-daemon.json`
    pub fn default_path(spec: &ProviderSpec) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("askd")
            .join(format!("{}-daemon.json", spec.name))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        persist::write_json(path, self)?;
        restrict_permissions(path);
        debug!(path = %path.display(), port = self.port, "wrote daemon state");
        Ok(())
    }

    /// Read the state file; unreadable or malformed files count as absent
    pub fn read(path: &Path) -> Option<Self> {
        match persist::read_json::<DaemonState>(path) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed daemon state");
                None
            }
        }
    }

    /// Seconds since `started_at`, when recorded
    pub fn uptime_secs(&self) -> Option<i64> {
        let started = chrono::DateTime::parse_from_rfc3339(self.started_at.as_deref()?).ok()?;
        Some((chrono::Utc::now() - started.with_timezone(&chrono::Utc)).num_seconds())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Remove `path` only if it still names `pid`; returns whether it was removed
pub fn remove_if_owned(path: &Path, pid: u32) -> bool {
    match DaemonState::read(path) {
        Some(state) if state.pid == pid => match fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), pid, "removed daemon state");
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove daemon state");
                false
            }
        },
        Some(state) => {
            debug!(path = %path.display(), owner = state.pid, pid, "daemon state owned by another process, leaving it");
            false
        }
        None => false,
    }
}

fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!(path = %path.display(), error = %e, "failed to restrict daemon state permissions");
    }
}
