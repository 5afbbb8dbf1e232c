//! askd daemon client
//!
//! Reads the provider's state file, opens one short-lived TCP connection per
//! exchange and falls back to autostart (or the sidecar bootstrap) when no
//! daemon answers. Socket errors never surface directly: they mean "no
//! daemon result" and trigger autostart followed by exactly one more try.

use crate::codec;
use crate::config::{ClientSettings, ProviderSettings};
use crate::daemon::discovery::WorkDirResolution;
use crate::daemon::protocol::{
    decode_jsonl, encode_jsonl, read_line_limited, RpcRequest, RpcResponse, MAX_LINE_BYTES,
};
use crate::daemon::state::DaemonState;
use crate::error::{AskError, Result};
use crate::provider::ProviderSpec;
use crate::retry::CHAIN_ENV;
use crate::session::{find_session_file, load_active_session};
use std::env;
use std::io::{self, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Name of the daemon executable
pub const DAEMON_PROGRAM: &str = "askd";

/// Interval between readiness and sidecar polls
const POLL_STEP: Duration = Duration::from_millis(50);

/// Client for one provider's daemon
pub struct DaemonClient {
    spec: ProviderSpec,
    provider: ProviderSettings,
    settings: ClientSettings,
    delegation_chain: Vec<String>,
}

impl DaemonClient {
    pub fn new(spec: ProviderSpec, provider: ProviderSettings, settings: ClientSettings) -> Self {
        Self {
            spec,
            provider,
            settings,
            delegation_chain: Vec::new(),
        }
    }

    /// Chain sent with requests and exported to the sidecar
    pub fn with_delegation_chain(mut self, chain: Vec<String>) -> Self {
        self.delegation_chain = chain;
        self
    }

    pub fn delegation_chain(&self) -> &[String] {
        &self.delegation_chain
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub fn state_path(&self) -> &Path {
        &self.provider.state_file
    }

    /// Current daemon state file contents, if any
    pub fn state(&self) -> Option<DaemonState> {
        DaemonState::read(&self.provider.state_file)
    }

    fn connect(&self, state: &DaemonState) -> io::Result<TcpStream> {
        let addrs: Vec<SocketAddr> = (state.host.as_str(), state.port).to_socket_addrs()?.collect();
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address for daemon host");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.settings.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Send one request line and read exactly one response line
    fn roundtrip(
        &self,
        state: &DaemonState,
        request: &RpcRequest,
        read_timeout: Option<Duration>,
    ) -> io::Result<RpcResponse> {
        let mut stream = self.connect(state)?;
        stream.set_read_timeout(read_timeout)?;
        stream.set_write_timeout(Some(self.settings.connect_timeout.max(Duration::from_secs(1))))?;
        stream.write_all(encode_jsonl(request)?.as_bytes())?;
        stream.flush()?;

        let mut reader = BufReader::new(stream);
        let line = read_line_limited(&mut reader, MAX_LINE_BYTES)?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "daemon closed the connection")
        })?;
        decode_jsonl(&line)
    }

    /// Whether a daemon answers ping with the expected pong
    pub fn ping(&self) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        let request = RpcRequest::ping(&self.spec, &codec::new_request_id(), &state.token);
        match self.roundtrip(&state, &request, Some(self.settings.connect_timeout.max(Duration::from_secs(1)))) {
            Ok(response) => response.kind == self.spec.pong_type() && response.error.is_none(),
            Err(e) => {
                debug!(provider = %self.spec.name, error = %e, "ping failed");
                false
            }
        }
    }

    /// Ask a running daemon to stop; `Ok(false)` if none is running
    pub fn shutdown(&self) -> Result<bool> {
        let Some(state) = self.state() else {
            return Ok(false);
        };
        let request = RpcRequest::shutdown(&self.spec, &codec::new_request_id(), &state.token);
        match self.roundtrip(&state, &request, Some(Duration::from_secs(5))) {
            Ok(response) => match response.error {
                Some(error) => Err(AskError::from_remote(&error, response.exit_code)),
                None => Ok(true),
            },
            Err(e) => {
                debug!(provider = %self.spec.name, error = %e, "shutdown request failed");
                Ok(false)
            }
        }
    }

    /// Whether the resolved directory has an active session bound
    pub fn has_active_session(&self, resolution: &WorkDirResolution) -> bool {
        let path = resolution
            .session_file
            .clone()
            .or_else(|| find_session_file(&self.spec, &resolution.work_dir));
        path.as_deref().and_then(load_active_session).is_some()
    }

    /// One attempt at a daemon round trip; `None` means "no daemon result"
    pub fn try_daemon_request(
        &self,
        resolution: &WorkDirResolution,
        message: &str,
        timeout_s: f64,
        quiet: bool,
    ) -> Option<RpcResponse> {
        if !self.provider.daemon_enabled {
            return None;
        }
        if !self.provider.sessionless && !self.has_active_session(resolution) {
            return None;
        }
        let state = self.state()?;

        let id = codec::new_request_id();
        let work_dir = resolution.work_dir.display().to_string();
        let mut request = RpcRequest::ask(&self.spec, &id, &state.token, &work_dir, message, timeout_s, quiet);
        request.delegation_chain = self.delegation_chain.clone();
        let read_timeout = (timeout_s >= 0.0 && timeout_s.is_finite())
            .then(|| Duration::from_secs_f64(timeout_s) + self.settings.read_grace);

        match self.roundtrip(&state, &request, read_timeout) {
            Ok(response) if response.kind != self.spec.response_type() => {
                warn!(kind = %response.kind, "unexpected response type from daemon");
                None
            }
            // errors raised before the request was parsed carry no id
            Ok(response) if response.id == id || (response.id.is_empty() && response.error.is_some()) => {
                Some(response)
            }
            Ok(response) => {
                warn!(expected = %id, got = %response.id, "daemon answered a different request");
                None
            }
            Err(e) => {
                debug!(provider = %self.spec.name, addr = %state.addr(), error = %e, "daemon request failed");
                None
            }
        }
    }

    /// Locate the daemon executable: next to this one, else on `PATH`
    pub fn find_daemon_executable() -> Option<PathBuf> {
        if let Some(sibling) = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DAEMON_PROGRAM)))
            .filter(|p| p.is_file())
        {
            return Some(sibling);
        }
        env::var_os("PATH").and_then(|paths| {
            env::split_paths(&paths)
                .map(|dir| dir.join(DAEMON_PROGRAM))
                .find(|candidate| candidate.is_file())
        })
    }

    /// Start a detached daemon if allowed, then wait until it answers ping
    pub fn maybe_start_daemon(&self) -> bool {
        if !self.provider.autostart {
            debug!(provider = %self.spec.name, "autostart disabled");
            return false;
        }
        let Some(program) = Self::find_daemon_executable() else {
            warn!("daemon executable not found");
            return false;
        };

        let mut command = Command::new(&program);
        command
            .arg(&self.spec.name)
            .arg("start")
            .env(format!("ASK_{}_STATE_FILE", self.spec.env_key()), &self.provider.state_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: setsid is async-signal-safe and touches no parent state
        unsafe {
            command.pre_exec(|| nix::unistd::setsid().map(|_| ()).map_err(io::Error::from));
        }

        match command.spawn() {
            Ok(child) => {
                info!(provider = %self.spec.name, pid = child.id(), program = %program.display(), "started daemon");
            }
            Err(e) => {
                warn!(program = %program.display(), error = %e, "failed to start daemon");
                return false;
            }
        }
        self.wait_for_daemon_ready(self.settings.ready_wait)
    }

    /// Poll ping until it succeeds or `timeout` elapses
    pub fn wait_for_daemon_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.ping() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_STEP);
        }
    }

    /// Launch the sidecar to create the session, then wait for it to appear
    pub fn maybe_start_sidecar(&self, resolution: &WorkDirResolution) -> bool {
        let sidecar = &self.settings.sidecar;
        if !sidecar.enabled {
            return false;
        }
        let Some(command) = sidecar.command.as_deref() else {
            warn!("sidecar enabled but no command configured");
            return false;
        };

        let sentinel = env::temp_dir().join(format!("askd-sidecar-{}", codec::new_request_id()));
        let spawned = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&resolution.work_dir)
            .env("ASK_PROVIDER", &self.spec.name)
            .env("ASK_WORK_DIR", &resolution.work_dir)
            .env("ASK_SIDECAR_SENTINEL", &sentinel)
            .env("ASK_SIDECAR_DIRECTION", &sidecar.direction)
            .env(CHAIN_ENV, self.delegation_chain.join(","))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            warn!(error = %e, "failed to launch sidecar");
            return false;
        }

        let deadline = Instant::now() + sidecar.timeout;
        let mut ready = false;
        while Instant::now() < deadline {
            if sentinel.exists() && self.has_active_session(resolution) {
                ready = true;
                break;
            }
            thread::sleep(POLL_STEP);
        }
        let _ = std::fs::remove_file(&sentinel);
        if !ready {
            warn!(provider = %self.spec.name, "sidecar did not produce a session in time");
        }
        ready
    }

    /// Full round trip: direct attempt, bootstrap, then one retry
    pub fn ask(
        &self,
        resolution: &WorkDirResolution,
        message: &str,
        timeout_s: f64,
        quiet: bool,
    ) -> Result<RpcResponse> {
        if !self.provider.daemon_enabled {
            return Err(AskError::DaemonUnavailable {
                provider: self.spec.name.clone(),
                reason: "daemon disabled by configuration".to_string(),
            });
        }

        if let Some(response) = self.try_daemon_request(resolution, message, timeout_s, quiet) {
            return Ok(response);
        }

        if !self.provider.sessionless
            && !self.has_active_session(resolution)
            && !self.maybe_start_sidecar(resolution)
        {
            return Err(AskError::SessionNotFound {
                provider: self.spec.name.clone(),
                work_dir: resolution.work_dir.clone(),
            });
        }

        let started = self.ping() || self.maybe_start_daemon();
        if let Some(response) = self.try_daemon_request(resolution, message, timeout_s, quiet) {
            return Ok(response);
        }

        Err(AskError::DaemonUnavailable {
            provider: self.spec.name.clone(),
            reason: if started {
                "daemon did not answer the request".to_string()
            } else {
                "no daemon running and autostart unavailable".to_string()
            },
        })
    }
}
