//! Session worker: serializes every request for one session key
//!
//! Each worker owns one OS thread and a FIFO channel. For every task it
//! resolves the session, injects the wrapped prompt into the pane and polls
//! the captured text until the completion marker appears, the pane goes
//! quiet with a visible reply, the deadline passes or the pane dies.
//!
//! Failures (errors and panics alike) are converted into a result with
//! exit code 1; the worker then moves on to the next task.

use crate::codec;
use crate::error::{AskError, Result};
use crate::provider::ProviderSpec;
use crate::retry::CHAIN_ENV;
use crate::session::SessionLocator;
use crate::terminal::TerminalBackend;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{self, Read, Write};
use std::os::unix::process::CommandExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One request as the daemon received it
#[derive(Debug, Clone, PartialEq)]
pub struct AskRequest {
    pub client_id: String,
    pub work_dir: PathBuf,
    pub message: String,
    /// Seconds; negative means no deadline
    pub timeout_s: f64,
    /// Leave pane focus alone
    pub quiet: bool,
    pub output_path: Option<PathBuf>,
    /// Agents already delegating, outermost first, this provider included
    pub delegation_chain: Vec<String>,
}

impl AskRequest {
    pub fn new(work_dir: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            client_id: String::new(),
            work_dir: work_dir.into(),
            message: message.into(),
            timeout_s: -1.0,
            quiet: false,
            output_path: None,
            delegation_chain: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout_s: f64) -> Self {
        self.timeout_s = timeout_s;
        self
    }

    pub fn with_delegation_chain(mut self, chain: Vec<String>) -> Self {
        self.delegation_chain = chain;
        self
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq)]
pub struct TaskResult {
    /// 0 reply obtained, 1 hard failure, 2 timed out without a clean marker
    pub exit_code: i32,
    pub reply: String,
    pub req_id: String,
    pub session_key: String,
    pub done_seen: bool,
    /// Milliseconds from sending the prompt to seeing the marker
    pub done_ms: Option<u64>,
}

impl TaskResult {
    pub fn failure(req_id: &str, session_key: &str, err: &AskError) -> Self {
        Self {
            exit_code: 1,
            reply: err.to_string(),
            req_id: req_id.to_string(),
            session_key: session_key.to_string(),
            done_seen: false,
            done_ms: None,
        }
    }
}

struct TaskSlot {
    result: Mutex<Option<TaskResult>>,
    ready: Condvar,
}

/// A queued request plus its completion slot
pub struct Task {
    pub request: AskRequest,
    pub req_id: String,
    pub session_key: String,
    pub created_at: Instant,
    slot: Arc<TaskSlot>,
}

impl Task {
    /// Create a task and the handle its submitter waits on
    pub fn new(request: AskRequest, req_id: String, session_key: String) -> (Task, TaskHandle) {
        let slot = Arc::new(TaskSlot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let handle = TaskHandle {
            req_id: req_id.clone(),
            session_key: session_key.clone(),
            slot: slot.clone(),
        };
        let task = Task {
            request,
            req_id,
            session_key,
            created_at: Instant::now(),
            slot,
        };
        (task, handle)
    }

    fn deadline(&self) -> Option<Instant> {
        let timeout = self.request.timeout_s;
        (timeout >= 0.0 && timeout.is_finite())
            .then(|| self.created_at + Duration::from_secs_f64(timeout))
    }

    /// Publish the result; a detached handle simply never reads it
    fn complete(&self, result: TaskResult) {
        let mut slot = self.slot.result.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(result);
        self.slot.ready.notify_all();
    }
}

/// Submitter's side of a task. Dropping it detaches from the result.
pub struct TaskHandle {
    req_id: String,
    session_key: String,
    slot: Arc<TaskSlot>,
}

impl TaskHandle {
    pub fn req_id(&self) -> &str {
        &self.req_id
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// Block until the result is published or `timeout` elapses
    pub fn wait(&self, timeout: Option<Duration>) -> Option<TaskResult> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut slot = self.slot.result.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return Some(result);
            }
            match deadline {
                None => {
                    slot = self.slot.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (guard, _) = self
                        .slot
                        .ready
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    slot = guard;
                }
            }
        }
    }

    /// Take the result if it is already there
    pub fn try_result(&self) -> Option<TaskResult> {
        self.slot.result.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Polling parameters for the pane loop
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub liveness_interval: Duration,
    /// Unchanged-text period after which a visible reply without marker is
    /// accepted; zero disables the fallback
    pub quiet_threshold: Duration,
    pub startup_grace: Duration,
    pub capture_lines: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            liveness_interval: Duration::from_millis(2000),
            quiet_threshold: Duration::from_millis(10_000),
            startup_grace: Duration::ZERO,
            capture_lines: 400,
        }
    }
}

/// Non-interactive execution tried before the pane
pub trait FastPath: Send + Sync {
    fn execute(&self, request: &AskRequest, req_id: &str) -> Result<String>;
}

/// Pipes the message into a shell command and returns its stdout
#[derive(Debug, Clone)]
pub struct CommandFastPath {
    command: String,
}

impl CommandFastPath {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl FastPath for CommandFastPath {
    fn execute(&self, request: &AskRequest, req_id: &str) -> Result<String> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&request.work_dir)
            .env("ASK_REQ_ID", req_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .process_group(0);
        if !request.delegation_chain.is_empty() {
            command.env(CHAIN_ENV, request.delegation_chain.join(","));
        }
        let mut child = command.spawn()?;

        // stdout is drained and stdin fed on their own threads so neither
        // pipe can stall the deadline loop below
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| AskError::backend("fast path stdout not captured"))?;
        let reader = thread::spawn(move || {
            let mut out = String::new();
            stdout.read_to_string(&mut out).map(|_| out)
        });
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| AskError::backend("fast path stdin not captured"))?;
        let input = request.message.clone().into_bytes();
        let writer = thread::spawn(move || stdin.write_all(&input));

        let deadline = (request.timeout_s >= 0.0 && request.timeout_s.is_finite())
            .then(|| Instant::now() + Duration::from_secs_f64(request.timeout_s));
        let mut status = None;
        loop {
            if status.is_none() {
                status = child.try_wait()?;
            }
            if status.is_some() && reader.is_finished() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                kill_group(&mut child);
                return Err(AskError::Timeout {
                    seconds: request.timeout_s,
                });
            }
            thread::sleep(Duration::from_millis(20));
        }

        if writer.is_finished() {
            match writer.join() {
                Ok(Err(e)) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e.into()),
                Err(_) => return Err(AskError::backend("fast path writer panicked")),
                _ => {}
            }
        }
        let output = reader
            .join()
            .map_err(|_| AskError::backend("fast path reader panicked"))??;
        let status = status.ok_or_else(|| AskError::backend("fast path exit status missing"))?;
        if !status.success() {
            return Err(AskError::backend(format!("fast path command exited with {}", status)));
        }
        let reply = codec::sanitize(&output).trim().to_string();
        if reply.is_empty() {
            return Err(AskError::backend("fast path produced no output"));
        }
        Ok(reply)
    }
}

/// Kill the command and anything it started, then reap it
fn kill_group(child: &mut Child) {
    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        debug!(pid = child.id(), error = %e, "could not signal fast path process group");
        let _ = child.kill();
    }
    let _ = child.wait();
}

/// Everything a worker needs besides its queue
#[derive(Clone)]
pub struct WorkerContext {
    pub provider: ProviderSpec,
    pub locator: Arc<dyn SessionLocator>,
    pub settings: WorkerSettings,
    pub fast_path: Option<Arc<dyn FastPath>>,
}

struct WorkerShared {
    session_key: String,
    ctx: WorkerContext,
    queued: AtomicUsize,
    processed: AtomicU64,
    busy: AtomicBool,
}

/// Serialized executor for one session key
pub struct SessionWorker {
    shared: Arc<WorkerShared>,
    sender: Mutex<Option<Sender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionWorker {
    /// Start the worker thread
    pub fn spawn(session_key: &str, ctx: WorkerContext) -> Result<Self> {
        let shared = Arc::new(WorkerShared {
            session_key: session_key.to_string(),
            ctx,
            queued: AtomicUsize::new(0),
            processed: AtomicU64::new(0),
            busy: AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::channel();

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("askd-worker-{}", session_key))
            .spawn(move || run(thread_shared, rx))?;

        info!(session_key, "started session worker");
        Ok(Self {
            shared,
            sender: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn session_key(&self) -> &str {
        &self.shared.session_key
    }

    /// Append a task to this worker's FIFO queue
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            return Err(AskError::backend(format!(
                "worker for {} is shut down",
                self.shared.session_key
            )));
        };
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        sender.send(task).map_err(|_| {
            self.shared.queued.fetch_sub(1, Ordering::SeqCst);
            AskError::backend(format!("worker for {} has exited", self.shared.session_key))
        })
    }

    pub fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::SeqCst)
    }

    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.load(Ordering::SeqCst)
    }

    /// Close the queue and wait for queued tasks to drain
    pub fn stop(&self) {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(session_key = %self.shared.session_key, "worker thread panicked");
            }
        }
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<WorkerShared>, rx: Receiver<Task>) {
    while let Ok(task) = rx.recv() {
        shared.queued.fetch_sub(1, Ordering::SeqCst);
        shared.busy.store(true, Ordering::SeqCst);

        let outcome = catch_unwind(AssertUnwindSafe(|| process_task(&shared, &task)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(session_key = %shared.session_key, req_id = %task.req_id, error = %e, "task failed");
                TaskResult::failure(&task.req_id, &shared.session_key, &e)
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(session_key = %shared.session_key, req_id = %task.req_id, panic = %detail, "task panicked");
                let err = AskError::backend(format!("worker panicked: {}", detail));
                TaskResult::failure(&task.req_id, &shared.session_key, &err)
            }
        };

        shared.processed.fetch_add(1, Ordering::SeqCst);
        shared.busy.store(false, Ordering::SeqCst);
        task.complete(result);
    }
    debug!(session_key = %shared.session_key, "session worker stopped");
}

fn process_task(shared: &WorkerShared, task: &Task) -> Result<TaskResult> {
    let ctx = &shared.ctx;
    let request = &task.request;
    let id = task.req_id.as_str();

    if let Some(fast) = &ctx.fast_path {
        let started = Instant::now();
        match fast.execute(request, id) {
            Ok(reply) => {
                return Ok(TaskResult {
                    exit_code: 0,
                    reply,
                    req_id: id.to_string(),
                    session_key: shared.session_key.clone(),
                    done_seen: true,
                    done_ms: Some(started.elapsed().as_millis() as u64),
                });
            }
            Err(e) => {
                debug!(req_id = id, error = %e, "fast path failed, using the pane");
            }
        }
        if task.deadline().is_some_and(|d| Instant::now() >= d) {
            warn!(req_id = id, "deadline passed in the fast path, pane left untouched");
            return Ok(TaskResult {
                exit_code: 2,
                reply: String::new(),
                req_id: id.to_string(),
                session_key: shared.session_key.clone(),
                done_seen: false,
                done_ms: None,
            });
        }
    }

    let binding = ctx
        .locator
        .locate(&ctx.provider.name, &request.work_dir)?
        .ok_or_else(|| AskError::SessionNotFound {
            provider: ctx.provider.name.clone(),
            work_dir: request.work_dir.clone(),
        })?;
    let backend = binding.backend.as_ref();
    let pane = binding.pane.as_str();

    if !backend.is_alive(pane) {
        return Err(AskError::PaneUnavailable {
            pane: pane.to_string(),
        });
    }

    let prompt = codec::wrap(&request.message, id);
    if !ctx.settings.startup_grace.is_zero() {
        thread::sleep(ctx.settings.startup_grace);
    }
    if !request.quiet {
        if let Err(e) = backend.activate(pane) {
            debug!(pane, error = %e, "could not activate pane");
        }
    }
    backend.send_text(pane, &prompt)?;
    debug!(req_id = id, pane, session_key = %shared.session_key, "prompt sent");

    poll_for_reply(shared, task, backend, pane)
}

fn poll_for_reply(
    shared: &WorkerShared,
    task: &Task,
    backend: &dyn TerminalBackend,
    pane: &str,
) -> Result<TaskResult> {
    let settings = &shared.ctx.settings;
    let id = task.req_id.as_str();
    let deadline = task.deadline();
    let sent_at = Instant::now();
    let mut last_liveness = sent_at;
    let mut last_change = sent_at;
    let mut last_text = String::new();

    let result = |exit_code: i32, reply: String, done_seen: bool| TaskResult {
        exit_code,
        reply,
        req_id: id.to_string(),
        session_key: shared.session_key.clone(),
        done_seen,
        done_ms: done_seen.then(|| sent_at.elapsed().as_millis() as u64),
    };

    loop {
        let now = Instant::now();
        if now.duration_since(last_liveness) >= settings.liveness_interval {
            last_liveness = now;
            if !backend.is_alive(pane) {
                return Err(AskError::PaneDied {
                    pane: pane.to_string(),
                });
            }
        }

        let raw = match backend.capture_text(pane, settings.capture_lines) {
            Ok(raw) => raw,
            Err(_) if !backend.is_alive(pane) => {
                return Err(AskError::PaneDied {
                    pane: pane.to_string(),
                });
            }
            Err(e) => return Err(e),
        };
        let text = codec::sanitize(&raw);
        if text != last_text {
            last_text = text;
            last_change = now;
        }

        if codec::is_complete(&last_text, id) {
            return Ok(result(0, codec::extract_reply(&last_text, id), true));
        }

        let has_reply = codec::has_candidate_reply(&last_text, id);
        if has_reply
            && !settings.quiet_threshold.is_zero()
            && now.duration_since(last_change) >= settings.quiet_threshold
        {
            info!(req_id = id, "no completion marker, accepting reply after quiet period");
            return Ok(result(0, codec::extract_reply(&last_text, id), false));
        }

        if let Some(deadline) = deadline {
            if now >= deadline {
                warn!(req_id = id, "deadline passed without completion marker");
                let reply = if has_reply {
                    codec::extract_reply(&last_text, id)
                } else {
                    String::new()
                };
                return Ok(result(2, reply, false));
            }
        }

        let mut nap = settings.poll_interval;
        if let Some(deadline) = deadline {
            nap = nap.min(deadline.saturating_duration_since(Instant::now()));
        }
        thread::sleep(nap.max(Duration::from_millis(1)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionBinding;
    use std::path::Path;

    /// Pane that replies to every prompt it receives
    struct EchoPane {
        screen: Mutex<String>,
        alive: AtomicBool,
        reply: String,
    }

    impl EchoPane {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                screen: Mutex::new(String::new()),
                alive: AtomicBool::new(true),
                reply: reply.to_string(),
            })
        }
    }

    impl TerminalBackend for EchoPane {
        fn name(&self) -> &str {
            "fake"
        }
        fn activate(&self, _pane: &str) -> Result<()> {
            Ok(())
        }
        fn send_text(&self, _pane: &str, text: &str) -> Result<()> {
            let id = text
                .lines()
                .next()
                .and_then(|l| l.strip_prefix("[askd request "))
                .and_then(|l| l.strip_suffix(']'))
                .unwrap_or_default()
                .to_string();
            let mut screen = self.screen.lock().unwrap();
            screen.push_str(text);
            if !self.reply.is_empty() {
                screen.push_str(&format!("\nBEGIN:{id}\n{}\nDONE:{id}\n", self.reply));
            }
            Ok(())
        }
        fn capture_text(&self, _pane: &str, _max_lines: usize) -> Result<String> {
            Ok(self.screen.lock().unwrap().clone())
        }
        fn is_alive(&self, _pane: &str) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct OnePane(Option<Arc<dyn TerminalBackend>>);

    impl SessionLocator for OnePane {
        fn locate(&self, provider: &str, work_dir: &Path) -> Result<Option<SessionBinding>> {
            Ok(self.0.clone().map(|backend| SessionBinding {
                backend,
                pane: "%1".to_string(),
                session_file: work_dir.join(".codex-session"),
                session_key: self.session_key(provider, work_dir),
            }))
        }
    }

    fn settings() -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(5),
            liveness_interval: Duration::from_millis(5),
            quiet_threshold: Duration::from_millis(100),
            startup_grace: Duration::ZERO,
            capture_lines: 100,
        }
    }

    fn worker(backend: Option<Arc<dyn TerminalBackend>>, fast: Option<Arc<dyn FastPath>>) -> SessionWorker {
        let ctx = WorkerContext {
            provider: ProviderSpec::for_name("codex"),
            locator: Arc::new(OnePane(backend)),
            settings: settings(),
            fast_path: fast,
        };
        SessionWorker::spawn("codex:test", ctx).unwrap()
    }

    fn submit(worker: &SessionWorker, request: AskRequest) -> TaskHandle {
        let (task, handle) = Task::new(request, codec::new_request_id(), "codex:test".to_string());
        worker.enqueue(task).unwrap();
        handle
    }

    #[test]
    fn test_reply_with_marker() {
        let worker = worker(Some(EchoPane::new("hello there")), None);
        let handle = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(5.0));
        let result = handle.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.reply, "hello there");
        assert!(result.done_seen);
        assert!(result.done_ms.is_some());
        assert_eq!(result.req_id, handle.req_id());
    }

    #[test]
    fn test_missing_session_fails_without_backend() {
        let worker = worker(None, None);
        let handle = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(1.0));
        let result = handle.wait(Some(Duration::from_secs(5))).unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.reply.contains("no active session"));
    }

    #[test]
    fn test_dead_pane_is_unavailable() {
        let pane = EchoPane::new("x");
        pane.alive.store(false, Ordering::SeqCst);
        let worker = worker(Some(pane), None);
        let result = submit(&worker, AskRequest::new("/tmp", "hi"))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.exit_code, 1);
        assert!(result.reply.contains("pane not available"));
    }

    #[test]
    fn test_deadline_without_reply_is_soft_failure() {
        let worker = worker(Some(EchoPane::new("")), None);
        let result = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(0.05))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(!result.done_seen);
    }

    /// Pane that shows leftover output and never renders new input
    struct StalePane;

    impl TerminalBackend for StalePane {
        fn name(&self) -> &str {
            "fake"
        }
        fn activate(&self, _pane: &str) -> Result<()> {
            Ok(())
        }
        fn send_text(&self, _pane: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        fn capture_text(&self, _pane: &str, _max_lines: usize) -> Result<String> {
            Ok("answer to an earlier question\nDONE:0badc0de\n".to_string())
        }
        fn is_alive(&self, _pane: &str) -> bool {
            true
        }
    }

    #[test]
    fn test_quiet_stale_screen_is_not_a_reply() {
        let worker = worker(Some(Arc::new(StalePane)), None);
        let result = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(0.4))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.reply, "");
        assert!(!result.done_seen);
    }

    #[test]
    fn test_handle_wait_times_out() {
        let (_task, handle) = Task::new(AskRequest::new("/tmp", "hi"), "ab".into(), "k".into());
        assert!(handle.wait(Some(Duration::from_millis(10))).is_none());
        assert!(handle.try_result().is_none());
    }

    struct Fixed(Result<String>);

    impl FastPath for Fixed {
        fn execute(&self, _request: &AskRequest, _req_id: &str) -> Result<String> {
            match &self.0 {
                Ok(s) => Ok(s.clone()),
                Err(e) => Err(AskError::backend(e.to_string())),
            }
        }
    }

    #[test]
    fn test_fast_path_short_circuits() {
        let worker = worker(None, Some(Arc::new(Fixed(Ok("fast".into())))));
        let result = submit(&worker, AskRequest::new("/tmp", "hi"))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.reply, "fast");
    }

    #[test]
    fn test_fast_path_failure_falls_through() {
        let worker = worker(
            Some(EchoPane::new("slow")),
            Some(Arc::new(Fixed(Err(AskError::backend("nope"))))),
        );
        let result = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(5.0))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.reply, "slow");
    }

    #[test]
    fn test_command_fast_path_reads_stdout() {
        let dir = tempfile::TempDir::new().unwrap();
        let fast = CommandFastPath::new("tr a-z A-Z");
        let reply = fast
            .execute(&AskRequest::new(dir.path(), "shout").with_timeout(5.0), "id")
            .unwrap();
        assert_eq!(reply, "SHOUT");

        let failing = CommandFastPath::new("exit 3");
        assert!(failing.execute(&AskRequest::new(dir.path(), "x"), "id").is_err());
    }

    struct SlowFailure(Duration);

    impl FastPath for SlowFailure {
        fn execute(&self, _request: &AskRequest, _req_id: &str) -> Result<String> {
            thread::sleep(self.0);
            Err(AskError::backend("too slow"))
        }
    }

    #[test]
    fn test_fast_path_past_deadline_leaves_pane_alone() {
        let pane = EchoPane::new("late");
        let worker = worker(
            Some(pane.clone()),
            Some(Arc::new(SlowFailure(Duration::from_millis(150)))),
        );
        let result = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(0.1))
            .wait(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(result.exit_code, 2);
        assert!(result.reply.is_empty());
        assert!(pane.screen.lock().unwrap().is_empty());
    }

    /// Run the fast path on its own thread so a hang fails the test instead
    /// of stalling it
    fn execute_bounded(fast: CommandFastPath, request: AskRequest) -> Result<String> {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = tx.send(fast.execute(&request, "id"));
        });
        rx.recv_timeout(Duration::from_secs(20))
            .expect("fast path did not return")
    }

    #[test]
    fn test_command_fast_path_streams_large_message() {
        let dir = tempfile::TempDir::new().unwrap();
        let message = "x".repeat(1 << 20);
        let request = AskRequest::new(dir.path(), message.clone()).with_timeout(10.0);
        let reply = execute_bounded(CommandFastPath::new("cat"), request).unwrap();
        assert_eq!(reply.len(), message.len());
    }

    #[test]
    fn test_command_fast_path_deadline_kills_stuck_command() {
        let dir = tempfile::TempDir::new().unwrap();
        // never reads stdin, so the message fills the pipe
        let request = AskRequest::new(dir.path(), "y".repeat(1 << 20)).with_timeout(0.3);
        let started = Instant::now();
        let err = execute_bounded(CommandFastPath::new("sleep 30"), request).unwrap_err();
        assert_eq!(err.error_code(), "TIMEOUT");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_command_fast_path_exports_delegation_chain() {
        let dir = tempfile::TempDir::new().unwrap();
        let request = AskRequest::new(dir.path(), "hi")
            .with_timeout(5.0)
            .with_delegation_chain(vec!["gemini".into(), "codex".into()]);
        let fast = CommandFastPath::new("printf '%s' \"$ASK_DELEGATION_CHAIN\"");
        assert_eq!(fast.execute(&request, "id").unwrap(), "gemini,codex");
    }

    #[test]
    fn test_stop_drains_and_rejects() {
        let worker = worker(Some(EchoPane::new("done")), None);
        let handle = submit(&worker, AskRequest::new("/tmp", "hi").with_timeout(5.0));
        worker.stop();
        assert_eq!(handle.try_result().unwrap().exit_code, 0);
        assert_eq!(worker.processed(), 1);
        let (task, _h) = Task::new(AskRequest::new("/tmp", "x"), "cd".into(), "k".into());
        assert!(worker.enqueue(task).is_err());
    }
}
