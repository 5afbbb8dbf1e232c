mod common;

use askd::config::AskConfig;
use askd::context::{AskOptions, ClientContext, DaemonContext};
use askd::daemon::worker::WorkerContext;
use askd::daemon::{DaemonServer, DaemonState, WorkerPool};
use askd::provider::ProviderSpec;
use askd::ratelimit::{ManualClock, RateLimitConfig, RateLimiter};
use common::{fast_settings, write_session_file, FakeTerminal, MapLocator};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    project: PathBuf,
    state_path: PathBuf,
    config: AskConfig,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let project = dir.path().join("project");
        std::fs::create_dir(&project).unwrap();
        write_session_file(&project, "codex", "%1");
        let state_path = dir.path().join("codex-daemon.json");

        let mut config = AskConfig::default();
        config.set("ASK_CODEX_STATE_FILE", state_path.display().to_string());
        config.set("ASK_CODEX_AUTOSTART", "0");
        config.set("ASK_REGISTRY_DIR", dir.path().join("registry").display().to_string());
        config.set("ASK_STATE_DIR", dir.path().join("state").display().to_string());
        config.set("ASK_IDLE_TIMEOUT_S", "0");

        let spec = ProviderSpec::for_name("codex");
        let backend = FakeTerminal::pong();
        let pool = Arc::new(WorkerPool::new(WorkerContext {
            provider: spec.clone(),
            locator: Arc::new(MapLocator::new(backend).bind(&project, "%1")),
            settings: fast_settings(),
            fast_path: None,
        }));
        let handler = Arc::new(DaemonContext::new(config.clone(), spec.clone(), pool.clone()));
        let mut server = DaemonServer::new(spec, config.server_config(state_path.clone()), handler).unwrap();
        server.bind().unwrap();
        let server = thread::spawn(move || {
            server.run().unwrap();
            pool.shutdown();
        });

        Self {
            _dir: dir,
            project,
            state_path,
            config,
            server: Some(server),
        }
    }

    fn client(&self) -> ClientContext {
        ClientContext::new(self.config.clone())
            .with_limiter(
                RateLimiter::in_memory(RateLimitConfig::default())
                    .with_clock(Arc::new(ManualClock::new(0.0))),
            )
            .without_retry()
    }

    fn options(&self, timeout_s: f64) -> AskOptions {
        AskOptions {
            timeout_s,
            quiet: true,
            session_file: None,
            cwd: self.project.clone(),
        }
    }

    fn stop(&mut self) {
        let spec = ProviderSpec::for_name("codex");
        assert!(self.client().daemon_client(&spec).shutdown().unwrap());
        if let Some(server) = self.server.take() {
            server.join().unwrap();
        }
    }
}

#[test]
fn test_ping_scenario_end_to_end() {
    let mut harness = Harness::start();
    let ctx = harness.client();

    let outcome = ctx.ask("codex", "ping", &harness.options(5.0));
    let reply = outcome.result.unwrap();
    assert_eq!(reply.exit_code, 0);
    assert_eq!(reply.reply, "pong");
    assert_eq!(reply.provider, "codex");
    assert!(reply.meta.done_seen);
    assert!(reply.meta.session_key.unwrap().starts_with("codex:"));
    assert_eq!(reply.req_id.map(|id| id.len()), Some(32));
    assert_eq!(outcome.attempts.len(), 1);

    harness.stop();
}

#[test]
fn test_timeout_without_reply_maps_to_timeout_error() {
    let mut harness = Harness::start();
    let ctx = harness.client();

    let outcome = ctx.ask("codex", "hang", &harness.options(0.3));
    let err = outcome.result.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.error_code(), "TIMEOUT");

    // the session worker is free again
    let reply = ctx.ask("codex", "again", &harness.options(5.0)).result.unwrap();
    assert_eq!(reply.reply, "echo: again");

    harness.stop();
}

#[test]
fn test_daemon_client_ping_and_state_cleanup() {
    let mut harness = Harness::start();
    let spec = ProviderSpec::for_name("codex");
    let client = harness.client().daemon_client(&spec);

    let state = DaemonState::read(&harness.state_path).unwrap();
    assert_eq!(state.host, "127.0.0.1");
    assert_eq!(state.pid, std::process::id());
    assert_eq!(state.token.len(), 64);
    assert!(client.ping());

    harness.stop();
    assert!(!harness.state_path.exists());
    assert!(!client.ping());
}

#[test]
fn test_wrong_token_is_rejected() {
    let mut harness = Harness::start();
    let mut state = DaemonState::read(&harness.state_path).unwrap();
    let real = state.clone();
    state.token = "0".repeat(64);
    state.write(&harness.state_path).unwrap();

    let err = harness
        .client()
        .ask("codex", "ping", &harness.options(5.0))
        .result
        .unwrap_err();
    assert_eq!(err.error_code(), "DAEMON_ERROR");
    assert!(err.to_string().contains("bad token"));

    real.write(&harness.state_path).unwrap();
    harness.stop();
}
