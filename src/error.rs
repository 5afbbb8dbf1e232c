//! Error taxonomy for askd
//!
//! [`AskError`] is the typed error every layer returns. It carries a POSIX
//! style exit code (1 hard failure, 2 soft/ambiguous) and a stable error
//! code string. [`ErrorReport`] is the serializable form used on the wire and
//! for `ASK_ERROR_FORMAT=json` output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library
pub type Result<T> = std::result::Result<T, AskError>;

/// Errors produced while routing a request to a provider
#[derive(Debug, Error)]
pub enum AskError {
    /// No active session is bound to the working directory
    #[error("no active session for {provider} in {work_dir}")]
    SessionNotFound { provider: String, work_dir: PathBuf },

    /// The session exists but its pane cannot be reached
    #[error("pane not available: {pane}")]
    PaneUnavailable { pane: String },

    /// Liveness was lost while waiting for a reply
    #[error("pane died while waiting for reply: {pane}")]
    PaneDied { pane: String },

    /// Deadline elapsed without a completion marker
    #[error("timed out after {seconds:.1}s waiting for reply")]
    Timeout { seconds: f64 },

    /// Bad token, malformed JSON or an unexpected message type
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// Delegation would re-enter an agent already on the call stack
    #[error("circular delegation: {}", chain.join(" -> "))]
    CircularDelegation { chain: Vec<String> },

    /// Token bucket had no capacity left
    #[error("rate limited: {provider} (retry in {retry_after_s:.1}s)")]
    RateLimited { provider: String, retry_after_s: f64 },

    /// The terminal driver failed
    #[error("backend error: {0}")]
    Backend(String),

    /// No daemon answered, even after autostart
    #[error("{provider} daemon unavailable: {reason}")]
    DaemonUnavailable { provider: String, reason: String },

    /// An explicit session file failed validation
    #[error("invalid session file {path}: {reason}")]
    InvalidSessionFile { path: PathBuf, reason: String },

    /// Failure reported by the daemon in a response line
    #[error("{message}")]
    Remote {
        code: String,
        message: String,
        exit_code: i32,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AskError {
    /// Exit code reported to the user for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AskError::Timeout { .. } => 2,
            AskError::Remote { exit_code, .. } => *exit_code,
            _ => 1,
        }
    }

    /// Stable machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            AskError::SessionNotFound { .. } => "SESSION_NOT_FOUND",
            AskError::PaneUnavailable { .. } => "PANE_UNAVAILABLE",
            AskError::PaneDied { .. } => "PANE_DIED",
            AskError::Timeout { .. } => "TIMEOUT",
            AskError::ProtocolMismatch(_) => "PROTOCOL_MISMATCH",
            AskError::CircularDelegation { .. } => "CIRCULAR_DELEGATION",
            AskError::RateLimited { .. } => "RATE_LIMITED",
            AskError::Backend(_) => "BACKEND_ERROR",
            AskError::DaemonUnavailable { .. } => "DAEMON_UNAVAILABLE",
            AskError::InvalidSessionFile { .. } => "INVALID_SESSION_FILE",
            AskError::Remote { .. } => "DAEMON_ERROR",
            AskError::Io(_) => "IO_ERROR",
            AskError::Json(_) => "JSON_ERROR",
        }
    }

    /// Reason tag understood by the retry policy
    pub fn reason_tag(&self) -> Option<&'static str> {
        match self {
            AskError::Timeout { .. } => Some("timeout"),
            AskError::RateLimited { .. } => Some("rate_limited"),
            AskError::DaemonUnavailable { .. } => Some("unavailable"),
            AskError::PaneDied { .. } => Some("pane_died"),
            AskError::SessionNotFound { .. } => Some("no_session"),
            AskError::CircularDelegation { .. } => Some("circular_delegation"),
            AskError::Remote { code, .. } => match code.as_str() {
                "TIMEOUT" => Some("timeout"),
                "RATE_LIMITED" => Some("rate_limited"),
                "DAEMON_UNAVAILABLE" => Some("unavailable"),
                "PANE_DIED" => Some("pane_died"),
                "SESSION_NOT_FOUND" => Some("no_session"),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        AskError::Backend(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        AskError::ProtocolMismatch(message.into())
    }

    /// Rebuild an error from a `"CODE: message"` response field
    pub fn from_remote(text: &str, exit_code: i32) -> Self {
        let (code, message) = match text.split_once(": ") {
            Some((code, message))
                if !code.is_empty() && code.chars().all(|c| c.is_ascii_uppercase() || c == '_') =>
            {
                (code.to_string(), message.to_string())
            }
            _ => ("DAEMON_ERROR".to_string(), text.to_string()),
        };
        AskError::Remote {
            code,
            message,
            exit_code: if exit_code == 0 { 1 } else { exit_code },
        }
    }
}

/// Serializable error report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    /// Error code category
    pub error_code: String,
    /// Human-readable error message
    pub message: String,
    /// Exit code for the caller
    pub exit_code: i32,
    /// Additional context information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl ErrorReport {
    pub fn new(error_code: impl Into<String>, message: impl Into<String>, exit_code: i32) -> Self {
        Self {
            error_code: error_code.into(),
            message: message.into(),
            exit_code,
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Format as a JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"error_code":"{}","message":"{}","exit_code":{}}}"#,
                self.error_code, self.message, self.exit_code
            )
        })
    }

    /// Format as a single line: `CODE: message`
    pub fn to_text(&self) -> String {
        format!("{}: {}", self.error_code, self.message)
    }
}

impl From<&AskError> for ErrorReport {
    fn from(err: &AskError) -> Self {
        ErrorReport::new(err.error_code(), err.to_string(), err.exit_code())
    }
}

/// Check if errors should be printed as JSON (`ASK_ERROR_FORMAT=json`)
pub fn should_output_json_errors() -> bool {
    std::env::var("ASK_ERROR_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AskError::Timeout { seconds: 3.0 }.exit_code(), 2);
        assert_eq!(AskError::PaneDied { pane: "%1".into() }.exit_code(), 1);
        assert_eq!(AskError::protocol("bad token").exit_code(), 1);
    }

    #[test]
    fn test_circular_delegation_message() {
        let err = AskError::CircularDelegation {
            chain: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "circular delegation: a -> b -> a");
        assert_eq!(err.error_code(), "CIRCULAR_DELEGATION");
    }

    #[test]
    fn test_reason_tags() {
        let limited = AskError::RateLimited {
            provider: "codex".into(),
            retry_after_s: 1.0,
        };
        assert_eq!(limited.reason_tag(), Some("rate_limited"));
        assert_eq!(AskError::backend("boom").reason_tag(), None);
    }

    #[test]
    fn test_report_from_error() {
        let err = AskError::PaneUnavailable { pane: "%7".into() };
        let report = ErrorReport::from(&err);
        assert_eq!(report.error_code, "PANE_UNAVAILABLE");
        assert_eq!(report.exit_code, 1);
        assert_eq!(report.to_text(), "PANE_UNAVAILABLE: pane not available: %7");
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = AskError::from_remote("RATE_LIMITED: rate limited: codex (retry in 2.0s)", 1);
        assert_eq!(err.reason_tag(), Some("rate_limited"));
        assert_eq!(err.to_string(), "rate limited: codex (retry in 2.0s)");

        let timeout = AskError::from_remote("TIMEOUT: timed out after 3.0s waiting for reply", 2);
        assert_eq!(timeout.exit_code(), 2);

        let plain = AskError::from_remote("something odd", 0);
        assert_eq!(plain.exit_code(), 1);
        assert_eq!(plain.reason_tag(), None);
    }

    #[test]
    fn test_report_to_json() {
        let report = ErrorReport::new("TEST_ERROR", "Test message", 2)
            .with_context(serde_json::json!({"pane": "%3"}));
        let json = report.to_json();
        assert!(json.contains("TEST_ERROR"));
        assert!(json.contains("Test message"));
        assert!(json.contains("\"pane\":\"%3\""));
    }
}
