//! Daemon RPC server
//!
//! Loopback TCP listener speaking the JSONL protocol in
//! [`crate::daemon::protocol`]. Each accepted connection is served on its own
//! thread (up to `max_connections` at once): one request line in, one
//! response line out. Requests must carry the token recorded in the state
//! file.
//!
//! The accept loop is non-blocking so it can watch the shutdown flag (set by
//! SIGTERM/SIGINT, a shutdown message or the idle timer). Every stop path
//! ends with the state file being removed, but only if it still names this
//! process.

use crate::codec;
use crate::daemon::protocol::{
    decode_jsonl, encode_jsonl, read_line_limited, RpcRequest, RpcResponse, MAX_LINE_BYTES,
    PROTOCOL_VERSION,
};
use crate::daemon::state::{self, DaemonState};
use crate::error::{AskError, Result};
use crate::provider::ProviderSpec;
use std::io::{BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Sleep between non-blocking accept attempts
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// How long shutdown waits for in-flight connections
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serves `<prefix>.request` messages
pub trait RequestHandler: Send + Sync {
    fn handle(&self, request: &RpcRequest) -> Result<RpcResponse>;
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub state_path: PathBuf,
    /// Stop after this long without requests; `None` never stops
    pub idle_timeout: Option<Duration>,
    pub max_connections: usize,
    /// Fixed token; a random one is generated when `None`
    pub token: Option<String>,
    /// Bound on reading the request line
    pub read_timeout: Duration,
}

impl ServerConfig {
    pub fn new(state_path: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            state_path,
            idle_timeout: Some(Duration::from_secs(1800)),
            max_connections: 32,
            token: None,
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// State shared with connection threads
struct Shared {
    spec: ProviderSpec,
    token: String,
    handler: Arc<dyn RequestHandler>,
    shutdown: Arc<AtomicBool>,
    active: AtomicUsize,
    last_activity: Mutex<Instant>,
    read_timeout: Duration,
}

impl Shared {
    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

/// Main daemon server
pub struct DaemonServer {
    config: ServerConfig,
    shared: Arc<Shared>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
}

impl DaemonServer {
    /// Fails only when no auth token can be generated
    pub fn new(spec: ProviderSpec, config: ServerConfig, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let token = match config.token.clone() {
            Some(token) => token,
            None => codec::new_token()?,
        };
        Ok(Self {
            shared: Arc::new(Shared {
                spec,
                token,
                handler,
                shutdown: Arc::new(AtomicBool::new(false)),
                active: AtomicUsize::new(0),
                last_activity: Mutex::new(Instant::now()),
                read_timeout: config.read_timeout,
            }),
            config,
            listener: None,
            local_addr: None,
        })
    }

    pub fn token(&self) -> &str {
        &self.shared.token
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Flag that stops the accept loop when set
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shared.shutdown.clone()
    }

    /// Stop on SIGTERM and SIGINT
    pub fn register_signals(&self) -> Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, self.shared.shutdown.clone())?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, self.shared.shutdown.clone())?;
        Ok(())
    }

    /// Bind the listener and publish the state file
    pub fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))?;
        let addr = listener.local_addr()?;

        DaemonState {
            host: self.config.host.clone(),
            port: addr.port(),
            token: self.shared.token.clone(),
            pid: std::process::id(),
            started_at: Some(chrono::Utc::now().to_rfc3339()),
        }
        .write(&self.config.state_path)?;

        info!(provider = %self.shared.spec.name, %addr, state = %self.config.state_path.display(), "daemon listening");
        self.listener = Some(listener);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    /// Bind (if needed) and serve until shut down
    pub fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind()?;
        }
        let result = self.accept_loop();
        self.shutdown_gracefully();
        result
    }

    fn accept_loop(&mut self) -> Result<()> {
        let listener = self
            .listener
            .take()
            .ok_or_else(|| AskError::backend("listener not bound"))?;

        // Set non-blocking mode for accept to check shutdown flag
        listener.set_nonblocking(true)?;
        self.shared.touch();

        while !self.shared.shutdown.load(Ordering::SeqCst) {
            if let Some(idle) = self.config.idle_timeout {
                if self.shared.active.load(Ordering::SeqCst) == 0 && self.shared.idle_for() >= idle {
                    info!(idle_s = idle.as_secs(), "idle timeout reached, stopping");
                    break;
                }
            }

            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!(%peer, error = %e, "could not configure connection");
                        continue;
                    }
                    self.dispatch_connection(stream, peer);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!(error = %e, "error accepting connection");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }
        Ok(())
    }

    fn dispatch_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = self.shared.clone();
        if shared.active.load(Ordering::SeqCst) >= self.config.max_connections {
            warn!(%peer, "maximum concurrent connections reached, rejecting");
            let response =
                RpcResponse::error(&shared.spec, "", &AskError::backend("server busy, try again"));
            let _ = write_response(&stream, &response);
            return;
        }

        shared.active.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name("askd-conn".to_string())
            .spawn({
                let shared = shared.clone();
                move || {
                    if let Err(e) = serve_connection(&shared, stream) {
                        debug!(%peer, error = %e, "connection ended with error");
                    }
                    shared.active.fetch_sub(1, Ordering::SeqCst);
                }
            });
        if let Err(e) = spawned {
            shared.active.fetch_sub(1, Ordering::SeqCst);
            error!(error = %e, "failed to spawn connection thread");
        }
    }

    fn shutdown_gracefully(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);

        let started = Instant::now();
        while self.shared.active.load(Ordering::SeqCst) > 0 && started.elapsed() < DRAIN_TIMEOUT {
            thread::sleep(ACCEPT_POLL);
        }

        state::remove_if_owned(&self.config.state_path, std::process::id());
        info!(provider = %self.shared.spec.name, "daemon stopped");
    }
}

fn write_response(mut stream: &TcpStream, response: &RpcResponse) -> std::io::Result<()> {
    let line = encode_jsonl(response)?;
    stream.write_all(line.as_bytes())?;
    stream.flush()
}

fn serve_connection(shared: &Shared, stream: TcpStream) -> std::io::Result<()> {
    stream.set_read_timeout(Some(shared.read_timeout))?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let Some(line) = read_line_limited(&mut reader, MAX_LINE_BYTES)? else {
        return Ok(());
    };

    let response = match decode_jsonl::<RpcRequest>(&line) {
        Ok(request) => dispatch(shared, &request),
        Err(e) => RpcResponse::error(
            &shared.spec,
            "",
            &AskError::protocol(format!("malformed request: {}", e)),
        ),
    };
    write_response(&stream, &response)
}

/// Compare tokens without short-circuiting on the first differing byte
fn token_matches(expected: &str, given: &str) -> bool {
    let (a, b) = (expected.as_bytes(), given.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn dispatch(shared: &Shared, request: &RpcRequest) -> RpcResponse {
    let spec = &shared.spec;
    let id = request.id.as_str();

    if !token_matches(&shared.token, &request.token) {
        warn!(kind = %request.kind, "rejected request with bad token");
        return RpcResponse::error(spec, id, &AskError::protocol("bad token"));
    }
    if request.v != PROTOCOL_VERSION {
        return RpcResponse::error(
            spec,
            id,
            &AskError::protocol(format!("unsupported protocol version {}", request.v)),
        );
    }

    if request.kind == spec.ping_type() {
        return RpcResponse::pong(spec, id);
    }
    if request.kind == spec.shutdown_type() {
        info!("shutdown requested");
        shared.shutdown.store(true, Ordering::SeqCst);
        return RpcResponse::ack(spec, id, "shutting down");
    }
    if request.kind != spec.request_type() {
        return RpcResponse::error(
            spec,
            id,
            &AskError::protocol(format!("unexpected message type '{}'", request.kind)),
        );
    }

    shared.touch();
    let outcome = catch_unwind(AssertUnwindSafe(|| shared.handler.handle(request)));
    shared.touch();
    match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            warn!(id, error = %e, "request failed");
            RpcResponse::error(spec, id, &e)
        }
        Err(_) => {
            error!(id, "request handler panicked");
            RpcResponse::error(spec, id, &AskError::backend("request handler panicked"))
        }
    }
}
