//! Process contexts
//!
//! Everything a binary needs lives in one of these two values, built once at
//! startup and passed down explicitly: [`DaemonContext`] for `askd` (it is
//! the server's request handler) and [`ClientContext`] for `ask`.

use crate::config::AskConfig;
use crate::daemon::discovery::resolve_work_dir;
use crate::daemon::protocol::{ResponseMeta, RpcRequest, RpcResponse};
use crate::daemon::server::RequestHandler;
use crate::daemon::worker::AskRequest;
use crate::daemon::worker_pool::WorkerPool;
use crate::daemon::DaemonClient;
use crate::error::{AskError, Result};
use crate::hooks::{HookEvent, HookRegistry, Plugin};
use crate::provider::ProviderSpec;
use crate::ratelimit::RateLimiter;
use crate::retry::{extend_chain, DelegationGuard, RetryAttempt, RetryConfig, RetryOutcome, RetryPolicy};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Daemon-side context: the worker pool plus hooks
pub struct DaemonContext {
    config: AskConfig,
    spec: ProviderSpec,
    pool: Arc<WorkerPool>,
    hooks: HookRegistry,
}

impl DaemonContext {
    pub fn new(config: AskConfig, spec: ProviderSpec, pool: Arc<WorkerPool>) -> Self {
        Self {
            config,
            spec,
            pool,
            hooks: HookRegistry::new(),
        }
    }

    pub fn with_plugin(mut self, plugin: &dyn Plugin) -> Self {
        self.hooks.add_plugin(plugin);
        self
    }

    pub fn config(&self) -> &AskConfig {
        &self.config
    }

    pub fn spec(&self) -> &ProviderSpec {
        &self.spec
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }
}

impl RequestHandler for DaemonContext {
    fn handle(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let work_dir = request
            .work_dir
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .ok_or_else(|| AskError::protocol("request has no work_dir"))?;

        let ask = AskRequest {
            client_id: request.id.clone(),
            work_dir: PathBuf::from(work_dir),
            message: request.message.clone(),
            timeout_s: request.timeout_s,
            quiet: request.quiet,
            output_path: request.output_path.as_ref().map(PathBuf::from),
            delegation_chain: extend_chain(&request.delegation_chain, &self.spec.name),
        };
        self.hooks.fire(
            HookEvent::RequestReceived,
            &json!({
                "provider": self.spec.name,
                "id": request.id,
                "work_dir": work_dir,
                "timeout_s": request.timeout_s,
            }),
        );

        let handle = self.pool.submit(ask)?;
        debug!(id = %request.id, req_id = handle.req_id(), session_key = handle.session_key(), "request queued");

        let wait = (request.timeout_s >= 0.0 && request.timeout_s.is_finite())
            .then(|| Duration::from_secs_f64(request.timeout_s) + self.config.task_grace());
        let Some(result) = handle.wait(wait) else {
            // the worker still finishes the task; its result is discarded
            return Ok(RpcResponse {
                req_id: Some(handle.req_id().to_string()),
                exit_code: 2,
                reply: String::new(),
                meta: ResponseMeta {
                    session_key: Some(handle.session_key().to_string()),
                    ..ResponseMeta::default()
                },
                ..RpcResponse::ack(&self.spec, &request.id, "")
            });
        };

        self.hooks.fire(
            HookEvent::RequestCompleted,
            &json!({
                "provider": self.spec.name,
                "id": request.id,
                "req_id": result.req_id,
                "session_key": result.session_key,
                "exit_code": result.exit_code,
                "done_seen": result.done_seen,
                "done_ms": result.done_ms,
            }),
        );
        Ok(RpcResponse::from_result(&self.spec, &request.id, result))
    }
}

/// Per-invocation options of `ask`
#[derive(Debug, Clone)]
pub struct AskOptions {
    /// Seconds; negative means no deadline
    pub timeout_s: f64,
    pub quiet: bool,
    /// Explicit session file for the requested provider
    pub session_file: Option<PathBuf>,
    pub cwd: PathBuf,
}

/// A successful reply and where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct AskReply {
    pub provider: String,
    pub exit_code: i32,
    pub reply: String,
    pub req_id: Option<String>,
    pub meta: ResponseMeta,
}

/// Client-side context: limiter, retry policy and delegation guard
pub struct ClientContext {
    config: AskConfig,
    limiter: RateLimiter,
    retry: RetryPolicy,
    guard: DelegationGuard,
    hooks: HookRegistry,
}

impl ClientContext {
    pub fn new(config: AskConfig) -> Self {
        let mut limiter = RateLimiter::new(
            config.state_dir().join("ratelimit"),
            Default::default(),
        );
        for name in ProviderSpec::known_names() {
            limiter = limiter.with_provider_config(name, config.rate_limit(&ProviderSpec::for_name(name)));
        }
        Self {
            retry: RetryPolicy::new(config.retry()),
            guard: DelegationGuard::with_chain(config.delegation_chain()),
            hooks: HookRegistry::new(),
            limiter,
            config,
        }
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Single attempt, no fallback
    pub fn without_retry(self) -> Self {
        self.with_retry(RetryPolicy::new(RetryConfig::disabled()))
    }

    pub fn with_plugin(mut self, plugin: &dyn Plugin) -> Self {
        self.hooks.add_plugin(plugin);
        self
    }

    pub fn config(&self) -> &AskConfig {
        &self.config
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn guard(&self) -> &DelegationGuard {
        &self.guard
    }

    /// Client for `spec`'s daemon, carrying the current delegation chain
    pub fn daemon_client(&self, spec: &ProviderSpec) -> DaemonClient {
        DaemonClient::new(
            spec.clone(),
            self.config.provider(spec),
            self.config.client_settings(),
        )
        .with_delegation_chain(extend_chain(&self.guard.chain(), &spec.name))
    }

    /// Ask `provider`, retrying and falling back per policy
    pub fn ask(&self, provider: &str, message: &str, options: &AskOptions) -> RetryOutcome<AskReply> {
        let _scope = match self.guard.enter(provider) {
            Ok(scope) => scope,
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    provider: provider.to_string(),
                    attempts: Vec::new(),
                }
            }
        };

        let observer = |attempt: &RetryAttempt| {
            self.hooks.fire(
                HookEvent::RetryAttempt,
                &json!({
                    "attempt": attempt.attempt,
                    "provider": attempt.provider,
                    "success": attempt.success,
                    "latency_ms": attempt.latency.as_millis() as u64,
                    "error": attempt.error,
                    "reason": attempt.reason,
                }),
            );
        };
        self.retry.execute_with_retry(
            provider,
            |current| self.ask_once(provider, current, message, options),
            Some(&observer),
        )
    }

    fn ask_once(&self, original: &str, provider: &str, message: &str, options: &AskOptions) -> Result<AskReply> {
        let spec = ProviderSpec::for_name(provider);
        let _scope = if provider == original {
            None
        } else {
            Some(self.guard.enter(provider)?)
        };

        self.limiter
            .acquire(&spec.name, 1.0, true, Some(self.config.rate_wait()))?;

        let settings = self.config.client_settings();
        // an explicit session file names one provider's session only
        let explicit = (provider == original)
            .then_some(options.session_file.as_deref())
            .flatten();
        let resolution = resolve_work_dir(
            &spec,
            &settings,
            explicit,
            &options.cwd,
            &self.config.registry_dir(),
        )?;
        debug!(provider = %spec.name, work_dir = %resolution.work_dir.display(), source = ?resolution.source, "resolved work dir");

        let client = self.daemon_client(&spec);
        let response = client.ask(&resolution, message, options.timeout_s, options.quiet)?;
        let reply = interpret_response(&spec, options.timeout_s, response)?;
        info!(provider = %spec.name, exit_code = reply.exit_code, "reply received");
        Ok(reply)
    }
}

/// Turn a daemon response into a reply or a classified error
pub fn interpret_response(spec: &ProviderSpec, timeout_s: f64, response: RpcResponse) -> Result<AskReply> {
    if let Some(error) = response.error.as_deref() {
        return Err(AskError::from_remote(error, response.exit_code));
    }
    match response.exit_code {
        2 if response.reply.trim().is_empty() => Err(AskError::Timeout { seconds: timeout_s }),
        0 | 2 => Ok(AskReply {
            provider: spec.name.clone(),
            exit_code: response.exit_code,
            reply: response.reply,
            req_id: response.req_id,
            meta: response.meta,
        }),
        code => Err(AskError::Remote {
            code: "TASK_FAILED".to_string(),
            message: response.reply,
            exit_code: code,
        }),
    }
}
