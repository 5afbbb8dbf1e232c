//! `ask`: send one message to a provider's agent and print the reply
//!
//! Exit status is the task's: 0 reply received, 1 failure, 2 timed out or
//! ambiguous completion.

use anyhow::Result;
use askd::config::AskConfig;
use askd::context::{AskOptions, ClientContext};
use askd::error::{should_output_json_errors, AskError, ErrorReport};
use askd::persist;
use clap::Parser;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::debug;

#[derive(Parser)]
#[command(name = "ask")]
#[command(about = "Send a message to an AI agent running in a terminal pane")]
#[command(version)]
struct Cli {
    /// Provider to ask (codex, gemini, claude, opencode)
    provider: String,

    /// Message text; read from stdin when omitted
    message: Vec<String>,

    /// Seconds to wait for the reply (negative waits forever)
    #[arg(short, long, default_value_t = 120.0, allow_negative_numbers = true)]
    timeout: f64,

    /// Leave pane focus where it is
    #[arg(short, long)]
    quiet: bool,

    /// Also write the reply to this file
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Session file to use instead of discovering one
    #[arg(long)]
    session_file: Option<PathBuf>,

    /// Single attempt: no retries, no fallback provider
    #[arg(long)]
    no_retry: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(config: &AskConfig, verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = config.log_filter().unwrap_or_else(|| default_level.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&filter)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(io::stderr)
        .init();
}

fn read_message(words: &[String]) -> Result<String> {
    if !words.is_empty() {
        return Ok(words.join(" "));
    }
    let mut message = String::new();
    io::stdin().read_to_string(&mut message)?;
    Ok(message)
}

fn report_error(err: &AskError) -> i32 {
    let report = ErrorReport::from(err);
    if should_output_json_errors() {
        eprintln!("{}", report.to_json());
    } else {
        eprintln!("ask: {}", err);
    }
    report.exit_code
}

fn run(cli: Cli) -> Result<i32> {
    let config = AskConfig::load();
    init_logging(&config, cli.verbose);

    let message = read_message(&cli.message)?;
    if message.trim().is_empty() {
        eprintln!("ask: empty message");
        return Ok(1);
    }

    let mut ctx = ClientContext::new(config);
    if cli.no_retry {
        ctx = ctx.without_retry();
    }
    let options = AskOptions {
        timeout_s: cli.timeout,
        quiet: cli.quiet,
        session_file: cli.session_file,
        cwd: std::env::current_dir()?,
    };

    let outcome = ctx.ask(&cli.provider, &message, &options);
    debug!(attempts = outcome.attempts.len(), provider = %outcome.provider, "ask finished");

    let reply = match outcome.result {
        Ok(reply) => reply,
        Err(err) => return Ok(report_error(&err)),
    };

    if let Some(path) = &cli.output {
        persist::write_atomic(path, reply.reply.as_bytes())?;
    }
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", reply.reply)?;
    stdout.flush()?;
    Ok(reply.exit_code)
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("ask: {:#}", e);
            process::exit(1);
        }
    }
}
