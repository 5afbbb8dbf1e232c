//! Bounded retries with exponential backoff, provider fallback, and the
//! circular-delegation guard
//!
//! A failure whose reason is retryable (timeouts, rate limits, an unreachable
//! daemon) is retried against the same provider after a jittered backoff. Any
//! other failure moves on to the next provider of the fallback chain, if
//! fallback is enabled. Every attempt is recorded and reported to the
//! observer.

mod delegation;

pub use delegation::{extend_chain, DelegationGuard, DelegationScope, CHAIN_ENV};

use crate::error::{AskError, Result};
use rand::Rng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Error texts treated as transient when no reason tag is available
static TRANSIENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)time[sd]?\s*out|timeout|connection|unavailable|rate[\s_-]*limit|transient")
        .expect("valid regex")
});

/// Built-in fallback order per originating provider
pub fn default_fallback_chain(provider: &str) -> Vec<String> {
    let chain: &[&str] = match provider {
        "codex" => &["claude", "gemini"],
        "claude" => &["codex", "gemini"],
        "gemini" => &["claude", "codex"],
        "opencode" => &["claude", "codex"],
        _ => &["claude", "codex"],
    };
    chain
        .iter()
        .filter(|p| **p != provider)
        .map(|p| p.to_string())
        .collect()
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, fallbacks included
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay added or removed at random (0.2 = ±20%)
    pub jitter: f64,
    pub fallback_enabled: bool,
    pub retryable_reasons: Vec<String>,
    /// Overrides of [`default_fallback_chain`]
    pub fallback_chains: HashMap<String, Vec<String>>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8000),
            multiplier: 2.0,
            jitter: 0.2,
            fallback_enabled: true,
            retryable_reasons: ["timeout", "rate_limited", "unavailable", "connection", "transient"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback_chains: HashMap::new(),
        }
    }
}

impl RetryConfig {
    /// Single attempt, no fallback
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            fallback_enabled: false,
            ..Self::default()
        }
    }
}

/// Randomness for backoff jitter
pub trait JitterSource: Send + Sync {
    /// A value in `[-1.0, 1.0]`
    fn sample(&self) -> f64;
}

/// Uniform jitter from the thread RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomJitter;

impl JitterSource for RandomJitter {
    fn sample(&self) -> f64 {
        rand::rng().random_range(-1.0..=1.0)
    }
}

/// Constant jitter, for deterministic tests
#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0.clamp(-1.0, 1.0)
    }
}

/// One attempt as reported to observers and callers
#[derive(Debug, Clone, PartialEq)]
pub struct RetryAttempt {
    /// 1-based ordinal
    pub attempt: u32,
    pub provider: String,
    pub success: bool,
    pub latency: Duration,
    pub error: Option<String>,
    pub reason: Option<String>,
}

/// Final result plus the full attempt history
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Provider that produced `result`
    pub provider: String,
    pub attempts: Vec<RetryAttempt>,
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

pub struct RetryPolicy {
    config: RetryConfig,
    jitter: Arc<dyn JitterSource>,
    sleeper: Sleeper,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: Arc::new(RandomJitter),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    pub fn with_jitter(mut self, jitter: Arc<dyn JitterSource>) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Whether attempt `attempt` (0-based) should be followed by a retry of
    /// the same provider
    pub fn should_retry(&self, error: &str, reason: Option<&str>, attempt: u32) -> bool {
        if attempt + 1 >= self.config.max_attempts {
            return false;
        }
        match reason {
            Some(tag) => self.config.retryable_reasons.iter().any(|r| r == tag),
            None => TRANSIENT.is_match(error),
        }
    }

    /// Delay before the attempt following `attempt` (0-based)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay.as_secs_f64();
        let cap = self.config.max_delay.as_secs_f64();
        let exp = self.config.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let delay = (base * exp).clamp(0.0, cap);
        let jitter = self.config.jitter.max(0.0) * self.jitter.sample();
        let jittered = (delay * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered)
    }

    /// First provider of `original`'s chain that has not failed yet
    pub fn fallback_provider(&self, original: &str, failed: &[String]) -> Option<String> {
        let chain = self
            .config
            .fallback_chains
            .get(original)
            .cloned()
            .unwrap_or_else(|| default_fallback_chain(original));
        chain
            .into_iter()
            .find(|p| p != original && !failed.iter().any(|f| f == p))
    }

    /// Run `op` against `provider`, retrying and falling back per policy.
    ///
    /// `op` receives the provider to use for each attempt. `observer` sees
    /// every attempt as soon as it finishes.
    pub fn execute_with_retry<T, F>(
        &self,
        provider: &str,
        mut op: F,
        observer: Option<&dyn Fn(&RetryAttempt)>,
    ) -> RetryOutcome<T>
    where
        F: FnMut(&str) -> Result<T>,
    {
        let mut attempts = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut current = provider.to_string();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let started = Instant::now();
            let result = op(&current);
            let latency = started.elapsed();

            let err = match result {
                Ok(value) => {
                    let record = RetryAttempt {
                        attempt: attempt + 1,
                        provider: current.clone(),
                        success: true,
                        latency,
                        error: None,
                        reason: None,
                    };
                    if let Some(observe) = observer {
                        observe(&record);
                    }
                    attempts.push(record);
                    return RetryOutcome {
                        result: Ok(value),
                        provider: current,
                        attempts,
                    };
                }
                Err(err) => err,
            };

            let message = err.to_string();
            let reason = err.reason_tag();
            let record = RetryAttempt {
                attempt: attempt + 1,
                provider: current.clone(),
                success: false,
                latency,
                error: Some(message.clone()),
                reason: reason.map(str::to_string),
            };
            if let Some(observe) = observer {
                observe(&record);
            }
            attempts.push(record);

            if attempt + 1 >= max_attempts || matches!(err, AskError::CircularDelegation { .. }) {
                return RetryOutcome {
                    result: Err(err),
                    provider: current,
                    attempts,
                };
            }

            if self.should_retry(&message, reason, attempt) {
                let delay = self.calculate_backoff(attempt);
                info!(provider = %current, attempt = attempt + 1, ?delay, error = %message, "retrying");
                (self.sleeper)(delay);
            } else if self.config.fallback_enabled {
                failed.push(current.clone());
                match self.fallback_provider(provider, &failed) {
                    Some(next) => {
                        let delay = self.calculate_backoff(attempt);
                        warn!(from = %current, to = %next, error = %message, "falling back to another provider");
                        (self.sleeper)(delay);
                        current = next;
                    }
                    None => {
                        return RetryOutcome {
                            result: Err(err),
                            provider: current,
                            attempts,
                        };
                    }
                }
            } else {
                return RetryOutcome {
                    result: Err(err),
                    provider: current,
                    attempts,
                };
            }

            attempt += 1;
        }
    }
}
