//! askd daemon binary
//!
//! Provides commands to start, stop, and inspect a provider's daemon.

use anyhow::{anyhow, bail, Context, Result};
use askd::config::AskConfig;
use askd::context::DaemonContext;
use askd::daemon::discovery::{register_session, validate_session_file};
use askd::daemon::worker::{CommandFastPath, FastPath, WorkerContext};
use askd::daemon::{DaemonClient, DaemonServer, WorkerPool};
use askd::provider::ProviderSpec;
use askd::ratelimit::RateLimiter;
use askd::session::FileSessionLocator;
use askd::terminal::TmuxBackend;
use clap::{Parser, Subcommand};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "askd")]
#[command(about = "Per-provider daemon routing requests into agent panes")]
#[command(version)]
struct Cli {
    /// Provider served by this daemon (codex, gemini, claude, opencode)
    provider: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon in the foreground
    Start {
        /// Port to listen on (0 picks a free one)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stop a running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Exit 0 if the daemon answers ping
    Ping,
    /// Record a session file in the project registry
    Register {
        /// Session file bound to the project
        session_file: PathBuf,
    },
}

fn init_logging(config: &AskConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = config.log_filter().unwrap_or_else(|| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AskConfig::load();
    init_logging(&config, cli.verbose);

    let spec = ProviderSpec::for_name(&cli.provider);
    match cli.command {
        Commands::Start { port } => start_daemon(config, spec, port),
        Commands::Stop => stop_daemon(&config, spec),
        Commands::Status => check_status(&config, spec),
        Commands::Ping => {
            let client = daemon_client(&config, spec);
            if client.ping() {
                println!("pong");
                Ok(())
            } else {
                eprintln!("{} daemon is not responding", client.spec().name);
                process::exit(1);
            }
        }
        Commands::Register { session_file } => register(&config, spec, session_file),
    }
}

fn daemon_client(config: &AskConfig, spec: ProviderSpec) -> DaemonClient {
    let provider = config.provider(&spec);
    DaemonClient::new(spec, provider, config.client_settings())
}

fn start_daemon(config: AskConfig, spec: ProviderSpec, port: Option<u16>) -> Result<()> {
    let provider = config.provider(&spec);
    if !provider.daemon_enabled {
        bail!("{} daemon is disabled (ASK_{}_DAEMON=0)", spec.name, spec.env_key());
    }

    // Check if daemon is already running
    let client = daemon_client(&config, spec.clone());
    if client.ping() {
        let state = client.state().map(|s| s.pid).unwrap_or_default();
        bail!("{} daemon is already running (pid {})", spec.name, state);
    }

    let locator = FileSessionLocator::new().with_backend(Arc::new(TmuxBackend::new()));
    let fast_path = provider
        .fast_cmd
        .as_deref()
        .map(|cmd| Arc::new(CommandFastPath::new(cmd)) as Arc<dyn FastPath>);
    let pool = Arc::new(WorkerPool::new(WorkerContext {
        provider: spec.clone(),
        locator: Arc::new(locator),
        settings: config.worker_settings(),
        fast_path,
    }));

    let mut server_config = config.server_config(provider.state_file.clone());
    if let Some(port) = port {
        server_config.port = port;
    }
    let handler = Arc::new(DaemonContext::new(config, spec.clone(), pool.clone()));
    let mut server = DaemonServer::new(spec.clone(), server_config, handler)?;
    server.register_signals()?;
    let addr = server.bind()?;
    info!(provider = %spec.name, %addr, pid = process::id(), "daemon started");

    let result = server.run();
    pool.shutdown();
    result.map_err(Into::into)
}

fn stop_daemon(config: &AskConfig, spec: ProviderSpec) -> Result<()> {
    let client = daemon_client(config, spec);
    let Some(state) = client.state() else {
        println!("{} daemon is not running (no state file).", client.spec().name);
        return Ok(());
    };

    if !client.shutdown()? {
        // unreachable over the socket; fall back to a signal
        let pid = i32::try_from(state.pid).map_err(|_| anyhow!("invalid pid {}", state.pid))?;
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => println!("Sent SIGTERM to daemon (pid {}).", state.pid),
            Err(e) => {
                println!("Daemon (pid {}) is gone ({}); removing stale state file.", state.pid, e);
                std::fs::remove_file(client.state_path())
                    .with_context(|| format!("removing {}", client.state_path().display()))?;
                return Ok(());
            }
        }
    }

    // Wait for the state file to be removed (up to 5 seconds)
    for _ in 0..50 {
        if client.state().is_none() {
            println!("Daemon stopped.");
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }
    eprintln!("Warning: daemon may not have stopped cleanly.");
    Ok(())
}

fn check_status(config: &AskConfig, spec: ProviderSpec) -> Result<()> {
    let client = daemon_client(config, spec);
    let name = client.spec().name.clone();
    match client.state() {
        None => println!("{} daemon is not running (no state file).", name),
        Some(state) => {
            let answering = client.ping();
            println!(
                "{} daemon at {} (pid {}): {}",
                name,
                state.addr(),
                state.pid,
                if answering { "running" } else { "not responding" }
            );
            if let Some(secs) = state.uptime_secs() {
                println!("Uptime: {}s", secs.max(0));
            }
            println!("State file: {}", client.state_path().display());
        }
    }

    let limiter = RateLimiter::new(config.state_dir().join("ratelimit"), config.rate_limit(client.spec()));
    let usage = limiter.usage(&name);
    let bucket = limiter.status(&name);
    println!(
        "Last 60s: {} requests, {:.1} tokens, {} rate limited ({:.1} tokens available)",
        usage.requests, usage.tokens, usage.limited, bucket.tokens
    );
    Ok(())
}

fn register(config: &AskConfig, spec: ProviderSpec, session_file: PathBuf) -> Result<()> {
    let cwd = std::env::current_dir()?;
    let session_file = validate_session_file(&spec, &session_file, &cwd, false)?;
    let work_dir = session_file
        .parent()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("session file has no parent directory"))?;
    register_session(&config.registry_dir(), &spec, &work_dir, &session_file)?;
    println!("Registered {} for {}", session_file.display(), work_dir.display());
    Ok(())
}
