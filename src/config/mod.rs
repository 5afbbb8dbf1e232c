//! Configuration from `~/.askrc` and the environment
//!
//! `~/.askrc` uses shell assignment syntax:
//!
//! ```text
//! # comments are ignored
//! export ASK_POLL_MS=100
//! ASK_CODEX_FAST_CMD="codex exec -"
//! ASK_RATE_RPM_GEMINI=20
//! ```
//!
//! Every `ASK_*` variable in the process environment overrides the file.
//! Typed views (`worker_settings`, `client_settings`, `rate_limit`, ...) fill
//! in defaults for anything unset; values that fail to parse are logged and
//! ignored.

use crate::daemon::server::ServerConfig;
use crate::daemon::state::DaemonState;
use crate::daemon::worker::WorkerSettings;
use crate::provider::ProviderSpec;
use crate::ratelimit::RateLimitConfig;
use crate::retry::RetryConfig;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Prefix of every recognized key
const KEY_PREFIX: &str = "ASK_";

/// Per-provider switches
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub daemon_enabled: bool,
    pub autostart: bool,
    /// Use the daemon even when no active session is found locally
    pub sessionless: bool,
    pub state_file: PathBuf,
    pub fast_cmd: Option<String>,
}

/// Sidecar bootstrap (launches the agent pane on demand)
#[derive(Debug, Clone, PartialEq)]
pub struct SidecarSettings {
    pub enabled: bool,
    pub command: Option<String>,
    pub timeout: Duration,
    /// Split direction passed to the sidecar command
    pub direction: String,
}

impl Default for SidecarSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            command: None,
            timeout: Duration::from_secs(15),
            direction: "right".to_string(),
        }
    }
}

/// Client-side timing and discovery switches
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub connect_timeout: Duration,
    /// Added to the request timeout to bound the response read
    pub read_grace: Duration,
    /// How long autostart waits for the daemon to answer ping
    pub ready_wait: Duration,
    pub registry_only: bool,
    /// `None` means detect (WSL)
    pub restricted_host: Option<bool>,
    pub session_file: Option<PathBuf>,
    pub sidecar: SidecarSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            read_grace: Duration::from_secs(10),
            ready_wait: Duration::from_millis(3000),
            registry_only: false,
            restricted_host: None,
            session_file: None,
            sidecar: SidecarSettings::default(),
        }
    }
}

/// Merged `~/.askrc` + environment
#[derive(Debug, Clone, Default)]
pub struct AskConfig {
    vars: HashMap<String, String>,
}

impl AskConfig {
    /// `~/.askrc` overridden by the process environment
    pub fn load() -> Self {
        let mut config = Self::from_file(&Self::askrc_path()).unwrap_or_default();
        config.overlay(std::env::vars());
        config
    }

    /// `$ASK_RC`, else `~/.askrc`
    pub fn askrc_path() -> PathBuf {
        if let Some(path) = std::env::var_os("ASK_RC").filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".askrc")
    }

    /// Parse configuration from a specific file
    pub fn from_file(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        Some(Self::parse(&content))
    }

    /// Parse configuration from content string
    pub fn parse(content: &str) -> Self {
        let mut config = AskConfig::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            if let Some((key, value)) = parse_assignment(line) {
                if key.starts_with(KEY_PREFIX) {
                    config.vars.insert(key, unquote(&value));
                }
            }
        }
        config
    }

    /// Apply `ASK_*` pairs on top of the current values
    pub fn overlay<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if key.starts_with(KEY_PREFIX) {
                self.vars.insert(key, value);
            }
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    /// Raw value; empty strings count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(key, value = raw, "ignoring unparsable setting");
                None
            }
        }
    }

    pub fn flag(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(|v| v.to_lowercase()) {
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
            Some(v) => {
                warn!(key, value = %v, "ignoring unrecognized flag value");
                default
            }
            None => default,
        }
    }

    fn millis(&self, key: &str, default_ms: u64) -> Duration {
        Duration::from_millis(self.parsed(key).unwrap_or(default_ms))
    }

    fn seconds(&self, key: &str, default_s: f64) -> Duration {
        let secs: f64 = self.parsed(key).unwrap_or(default_s);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Directory for limiter state and other per-user runtime files
    pub fn state_dir(&self) -> PathBuf {
        self.get("ASK_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| dirs::cache_dir().unwrap_or_else(std::env::temp_dir).join("askd"))
    }

    /// Tracing filter directive (`ASK_LOG`)
    pub fn log_filter(&self) -> Option<String> {
        self.get("ASK_LOG").map(str::to_string)
    }

    /// Project registry directory (`ASK_REGISTRY_DIR`)
    pub fn registry_dir(&self) -> PathBuf {
        self.get("ASK_REGISTRY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(crate::daemon::discovery::default_registry_dir)
    }

    /// Agents already delegating to this process, outermost first
    pub fn delegation_chain(&self) -> Vec<String> {
        self.get(crate::retry::CHAIN_ENV)
            .map(|chain| {
                chain
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Longest a blocking rate-limit acquire may wait
    pub fn rate_wait(&self) -> Duration {
        self.seconds("ASK_RATE_WAIT_S", 30.0)
    }

    /// Extra time the daemon waits for a task beyond its own deadline
    pub fn task_grace(&self) -> Duration {
        self.seconds("ASK_TASK_GRACE_S", 5.0)
    }

    pub fn provider(&self, spec: &ProviderSpec) -> ProviderSettings {
        let p = spec.env_key();
        ProviderSettings {
            daemon_enabled: self.flag(&format!("ASK_{p}_DAEMON"), true),
            autostart: self.flag(&format!("ASK_{p}_AUTOSTART"), true),
            sessionless: self.flag(&format!("ASK_{p}_SESSIONLESS"), false),
            state_file: self
                .get(&format!("ASK_{p}_STATE_FILE"))
                .map(PathBuf::from)
                .unwrap_or_else(|| DaemonState::default_path(spec)),
            fast_cmd: self.get(&format!("ASK_{p}_FAST_CMD")).map(str::to_string),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        let defaults = WorkerSettings::default();
        WorkerSettings {
            poll_interval: self.millis("ASK_POLL_MS", defaults.poll_interval.as_millis() as u64),
            liveness_interval: self.millis("ASK_LIVENESS_MS", defaults.liveness_interval.as_millis() as u64),
            quiet_threshold: self.millis("ASK_QUIET_MS", defaults.quiet_threshold.as_millis() as u64),
            startup_grace: self.millis("ASK_STARTUP_GRACE_MS", 0),
            capture_lines: self.parsed("ASK_CAPTURE_LINES").unwrap_or(defaults.capture_lines),
        }
    }

    pub fn client_settings(&self) -> ClientSettings {
        let defaults = ClientSettings::default();
        ClientSettings {
            connect_timeout: self.millis("ASK_CONNECT_TIMEOUT_MS", 500),
            read_grace: self.seconds("ASK_READ_GRACE_S", defaults.read_grace.as_secs_f64()),
            ready_wait: self.millis("ASK_READY_WAIT_MS", 3000),
            registry_only: self.flag("ASK_REGISTRY_ONLY", false),
            restricted_host: self.get("ASK_RESTRICTED_HOST").map(|_| self.flag("ASK_RESTRICTED_HOST", false)),
            session_file: self.get("ASK_SESSION_FILE").map(PathBuf::from),
            sidecar: self.sidecar_settings(),
        }
    }

    pub fn sidecar_settings(&self) -> SidecarSettings {
        let defaults = SidecarSettings::default();
        SidecarSettings {
            enabled: self.flag("ASK_SIDECAR", false),
            command: self.get("ASK_SIDECAR_CMD").map(str::to_string),
            timeout: self.seconds("ASK_SIDECAR_TIMEOUT_S", defaults.timeout.as_secs_f64()),
            direction: self
                .get("ASK_SIDECAR_DIRECTION")
                .map(str::to_string)
                .unwrap_or(defaults.direction),
        }
    }

    /// Server settings for `spec`, writing its state to `state_path`
    pub fn server_config(&self, state_path: PathBuf) -> ServerConfig {
        let mut config = ServerConfig::new(state_path);
        let idle: f64 = self.parsed("ASK_IDLE_TIMEOUT_S").unwrap_or(1800.0);
        config.idle_timeout = (idle > 0.0).then(|| Duration::from_secs_f64(idle));
        config.max_connections = self
            .parsed::<usize>("ASK_MAX_CONNECTIONS")
            .unwrap_or(config.max_connections)
            .max(1);
        config
    }

    pub fn rate_limit(&self, spec: &ProviderSpec) -> RateLimitConfig {
        let p = spec.env_key();
        let defaults = RateLimitConfig::default();
        RateLimitConfig {
            requests_per_minute: self
                .parsed(&format!("ASK_RATE_RPM_{p}"))
                .unwrap_or(defaults.requests_per_minute),
            burst: self
                .parsed(&format!("ASK_RATE_BURST_{p}"))
                .unwrap_or(defaults.burst),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        let mut chains = HashMap::new();
        for name in ProviderSpec::known_names() {
            let spec = ProviderSpec::for_name(name);
            if let Some(chain) = self.get(&format!("ASK_FALLBACK_{}", spec.env_key())) {
                chains.insert(
                    spec.name.clone(),
                    chain
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_lowercase())
                        .collect(),
                );
            }
        }
        RetryConfig {
            max_attempts: self.parsed("ASK_RETRY_MAX").unwrap_or(defaults.max_attempts).max(1),
            base_delay: self.millis("ASK_RETRY_BASE_MS", defaults.base_delay.as_millis() as u64),
            max_delay: self.millis("ASK_RETRY_CAP_MS", defaults.max_delay.as_millis() as u64),
            jitter: self.parsed::<f64>("ASK_RETRY_JITTER").unwrap_or(defaults.jitter).clamp(0.0, 1.0),
            fallback_enabled: self.flag("ASK_FALLBACK", defaults.fallback_enabled),
            fallback_chains: chains,
            ..defaults
        }
    }
}

/// Parse a shell variable assignment (KEY=value or KEY="value")
fn parse_assignment(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

/// Remove surrounding quotes from a value
fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_gives_defaults() {
        let config = AskConfig::parse("");
        assert_eq!(config.worker_settings(), WorkerSettings::default());
        assert_eq!(config.client_settings(), ClientSettings::default());
        let codex = config.provider(&ProviderSpec::for_name("codex"));
        assert!(codex.daemon_enabled && codex.autostart && !codex.sessionless);
        assert!(codex.fast_cmd.is_none());
    }

    #[test]
    fn test_parse_with_export_and_comments() {
        let content = r#"
# poll faster
export ASK_POLL_MS=50
ASK_QUIET_MS='2500'
ASK_CODEX_FAST_CMD="codex exec -"
EDITOR_MODE=ignored
not an assignment
"#;
        let config = AskConfig::parse(content);
        let worker = config.worker_settings();
        assert_eq!(worker.poll_interval, Duration::from_millis(50));
        assert_eq!(worker.quiet_threshold, Duration::from_millis(2500));
        assert_eq!(
            config.provider(&ProviderSpec::for_name("codex")).fast_cmd.as_deref(),
            Some("codex exec -")
        );
        assert!(config.get("EDITOR_MODE").is_none());
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut config = AskConfig::parse("ASK_GEMINI_AUTOSTART=1\nASK_RETRY_MAX=5");
        config.overlay(vec![
            ("ASK_GEMINI_AUTOSTART".to_string(), "0".to_string()),
            ("HOME".to_string(), "/nowhere".to_string()),
        ]);
        assert!(!config.provider(&ProviderSpec::for_name("gemini")).autostart);
        assert_eq!(config.retry().max_attempts, 5);
        assert!(config.get("HOME").is_none());
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = AskConfig::parse("ASK_POLL_MS=fast\nASK_FALLBACK=maybe");
        assert_eq!(config.worker_settings().poll_interval, Duration::from_millis(200));
        assert!(config.retry().fallback_enabled);
    }

    #[test]
    fn test_rate_limit_per_provider() {
        let config = AskConfig::parse("ASK_RATE_RPM_CLAUDE=12\nASK_RATE_BURST_CLAUDE=2");
        let claude = config.rate_limit(&ProviderSpec::for_name("claude"));
        assert_eq!(claude.requests_per_minute, 12.0);
        assert_eq!(claude.burst, 2.0);
        assert_eq!(config.rate_limit(&ProviderSpec::for_name("codex")), RateLimitConfig::default());
    }

    #[test]
    fn test_retry_and_fallback_chain() {
        let config = AskConfig::parse(
            "ASK_RETRY_BASE_MS=100\nASK_RETRY_JITTER=3\nASK_FALLBACK_CODEX=\"gemini, opencode\"",
        );
        let retry = config.retry();
        assert_eq!(retry.base_delay, Duration::from_millis(100));
        assert_eq!(retry.jitter, 1.0);
        assert_eq!(retry.fallback_chains["codex"], vec!["gemini", "opencode"]);
    }

    #[test]
    fn test_server_idle_timeout_zero_disables() {
        let config = AskConfig::parse("ASK_IDLE_TIMEOUT_S=0\nASK_MAX_CONNECTIONS=4");
        let server = config.server_config(PathBuf::from("/tmp/state.json"));
        assert!(server.idle_timeout.is_none());
        assert_eq!(server.max_connections, 4);
    }

    #[test]
    fn test_sidecar_and_restricted_host() {
        let config = AskConfig::parse(
            "ASK_SIDECAR=on\nASK_SIDECAR_CMD=launch-pane\nASK_SIDECAR_DIRECTION=down\nASK_RESTRICTED_HOST=1",
        );
        let client = config.client_settings();
        assert!(client.sidecar.enabled);
        assert_eq!(client.sidecar.command.as_deref(), Some("launch-pane"));
        assert_eq!(client.sidecar.direction, "down");
        assert_eq!(client.restricted_host, Some(true));
    }

    #[test]
    fn test_delegation_chain_and_waits() {
        let config = AskConfig::parse("ASK_DELEGATION_CHAIN=\"claude, codex,\"\nASK_RATE_WAIT_S=2.5");
        assert_eq!(config.delegation_chain(), vec!["claude", "codex"]);
        assert_eq!(config.rate_wait(), Duration::from_millis(2500));
        assert_eq!(config.task_grace(), Duration::from_secs(5));
        assert!(AskConfig::parse("").delegation_chain().is_empty());
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("  \"hello\"  "), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
