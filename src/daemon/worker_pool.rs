//! Worker pool keyed by session
//!
//! ## Architecture
//! - One [`SessionWorker`] per session key, created on first use
//! - Creation is get-or-create under the pool lock, so a key never has two
//!   workers
//! - Requests for the same key queue FIFO on that worker; different keys run
//!   on different threads and proceed in parallel
//! - `submit` returns a [`TaskHandle`] at once; callers wait on it separately

use crate::codec;
use crate::daemon::worker::{AskRequest, SessionWorker, Task, TaskHandle, WorkerContext};
use crate::error::{AskError, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Pool of per-session workers
pub struct WorkerPool {
    ctx: WorkerContext,
    workers: Mutex<HashMap<String, Arc<SessionWorker>>>,
    closed: Mutex<bool>,
}

impl WorkerPool {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            workers: Mutex::new(HashMap::new()),
            closed: Mutex::new(false),
        }
    }

    /// The worker for `session_key`, starting one if none exists
    pub fn get_or_create(&self, session_key: &str) -> Result<Arc<SessionWorker>> {
        if *self.closed.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(AskError::backend("worker pool is shut down"));
        }

        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(worker) = workers.get(session_key) {
            return Ok(worker.clone());
        }
        let worker = Arc::new(SessionWorker::spawn(session_key, self.ctx.clone())?);
        workers.insert(session_key.to_string(), worker.clone());
        Ok(worker)
    }

    /// Queue `request` on its session's worker
    pub fn submit(&self, request: AskRequest) -> Result<TaskHandle> {
        let session_key = self
            .ctx
            .locator
            .session_key(&self.ctx.provider.name, &request.work_dir);
        let worker = self.get_or_create(&session_key)?;
        let (task, handle) = Task::new(request, codec::new_request_id(), session_key);
        worker.enqueue(task)?;
        Ok(handle)
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        PoolStats {
            total_workers: workers.len(),
            busy_workers: workers.values().filter(|w| w.is_busy()).count(),
            queued_requests: workers.values().map(|w| w.queued()).sum(),
            total_requests_processed: workers.values().map(|w| w.processed()).sum(),
        }
    }

    /// Stop accepting work, drain every queue and join the worker threads
    pub fn shutdown(&self) {
        *self.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, worker)| worker)
            .collect();
        let count = workers.len();
        for worker in workers {
            worker.stop();
        }
        info!(workers = count, "worker pool shut down");
    }
}

/// Worker pool statistics
#[derive(Debug, Clone, PartialEq)]
pub struct PoolStats {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub queued_requests: usize,
    pub total_requests_processed: u64,
}
