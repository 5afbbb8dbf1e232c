//! Per-provider token bucket rate limiting
//!
//! Capacity is the configured burst; the bucket refills at
//! `requests_per_minute / 60` tokens per second of wall time. Bucket state is
//! persisted per provider so a restarted client does not get a fresh burst.
//! A JSONL event log next to the state feeds the trailing 60 second usage
//! report; it never gates requests.

mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use crate::error::{AskError, Result};
use crate::persist;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Longest single sleep while blocking in [`RateLimiter::acquire`]
const SLEEP_SLICE_S: f64 = 0.05;

/// Trailing window used by [`RateLimiter::usage`]
const WINDOW_S: f64 = 60.0;

/// Rewrite the event log once this many expired entries pile up
const LOG_PRUNE_THRESHOLD: usize = 64;

/// Bucket parameters for one provider
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_minute: f64,
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30.0,
            burst: 5.0,
        }
    }
}

impl RateLimitConfig {
    pub fn refill_rate(&self) -> f64 {
        (self.requests_per_minute / 60.0).max(0.0)
    }
}

/// Persisted bucket state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenBucketState {
    pub capacity: f64,
    pub tokens: f64,
    /// Tokens per second
    pub refill_rate: f64,
    /// Unix seconds of the last refill
    pub last_refill: f64,
}

impl TokenBucketState {
    pub fn full(config: &RateLimitConfig, now: f64) -> Self {
        Self {
            capacity: config.burst.max(0.0),
            tokens: config.burst.max(0.0),
            refill_rate: config.refill_rate(),
            last_refill: now,
        }
    }

    /// Add tokens for the time elapsed since the last refill.
    ///
    /// A clock that moved backwards adds nothing and leaves the timestamp
    /// alone, so the level never decreases here.
    pub fn refill(&mut self, now: f64) {
        let elapsed = now - self.last_refill;
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }

    pub fn try_take(&mut self, tokens: f64) -> bool {
        if self.tokens + 1e-9 >= tokens {
            self.tokens = (self.tokens - tokens).max(0.0);
            true
        } else {
            false
        }
    }

    /// Seconds until `tokens` are available (infinite if they never will be)
    pub fn wait_for(&self, tokens: f64) -> f64 {
        if self.tokens >= tokens {
            return 0.0;
        }
        if tokens > self.capacity || self.refill_rate <= 0.0 {
            return f64::INFINITY;
        }
        (tokens - self.tokens) / self.refill_rate
    }

    /// Adopt new limits, keeping the current level within the new capacity
    fn reconfigure(&mut self, config: &RateLimitConfig) {
        self.capacity = config.burst.max(0.0);
        self.refill_rate = config.refill_rate();
        self.tokens = self.tokens.clamp(0.0, self.capacity);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct UsageEvent {
    ts: f64,
    tokens: f64,
    event: String,
}

/// Trailing-window usage report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowUsage {
    pub requests: usize,
    pub tokens: f64,
    pub limited: usize,
}

/// Token bucket limiter for every provider
pub struct RateLimiter {
    state_dir: Option<PathBuf>,
    defaults: RateLimitConfig,
    overrides: HashMap<String, RateLimitConfig>,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, TokenBucketState>>,
}

impl RateLimiter {
    /// Limiter persisting under `state_dir` with the system clock
    pub fn new(state_dir: PathBuf, defaults: RateLimitConfig) -> Self {
        Self {
            state_dir: Some(state_dir),
            defaults,
            overrides: HashMap::new(),
            clock: Arc::new(SystemClock),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Limiter that keeps state in memory only
    pub fn in_memory(defaults: RateLimitConfig) -> Self {
        Self {
            state_dir: None,
            defaults,
            overrides: HashMap::new(),
            clock: Arc::new(SystemClock),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use specific limits for one provider
    pub fn with_provider_config(mut self, provider: &str, config: RateLimitConfig) -> Self {
        self.overrides.insert(provider.to_lowercase(), config);
        self
    }

    pub fn config_for(&self, provider: &str) -> RateLimitConfig {
        self.overrides
            .get(&provider.to_lowercase())
            .copied()
            .unwrap_or(self.defaults)
    }

    fn state_path(&self, provider: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", provider.to_lowercase())))
    }

    fn log_path(&self, provider: &str) -> Option<PathBuf> {
        self.state_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.log", provider.to_lowercase())))
    }

    fn load_bucket(&self, provider: &str, now: f64) -> TokenBucketState {
        let config = self.config_for(provider);
        let persisted = self.state_path(provider).and_then(|path| {
            persist::read_json::<TokenBucketState>(&path).unwrap_or_else(|e| {
                warn!(provider, error = %e, "ignoring unreadable rate limit state");
                None
            })
        });
        match persisted {
            Some(mut state) => {
                state.reconfigure(&config);
                state
            }
            None => TokenBucketState::full(&config, now),
        }
    }

    fn save_bucket(&self, provider: &str, state: &TokenBucketState) {
        if let Some(path) = self.state_path(provider) {
            if let Err(e) = persist::write_json(&path, state) {
                warn!(provider, error = %e, "failed to persist rate limit state");
            }
        }
    }

    fn record_event(&self, provider: &str, tokens: f64, event: &str) {
        let Some(path) = self.log_path(provider) else {
            return;
        };
        let entry = UsageEvent {
            ts: self.clock.now(),
            tokens,
            event: event.to_string(),
        };
        let result = (|| -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", serde_json::to_string(&entry)?)?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!(provider, error = %e, "failed to append rate limit event");
            return;
        }
        self.scan_log(provider, &path);
    }

    /// Tally the trailing window, rewriting the log without expired
    /// entries once enough of them have accumulated
    fn scan_log(&self, provider: &str, path: &Path) -> WindowUsage {
        let Ok(content) = fs::read_to_string(path) else {
            return WindowUsage::default();
        };

        let cutoff = self.clock.now() - WINDOW_S;
        let mut usage = WindowUsage::default();
        let mut kept = Vec::new();
        let mut expired = 0;

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(event) = serde_json::from_str::<UsageEvent>(line) else {
                expired += 1;
                continue;
            };
            if event.ts < cutoff {
                expired += 1;
                continue;
            }
            match event.event.as_str() {
                "acquired" => {
                    usage.requests += 1;
                    usage.tokens += event.tokens;
                }
                "limited" => usage.limited += 1,
                _ => {}
            }
            kept.push(line);
        }

        if expired >= LOG_PRUNE_THRESHOLD {
            let mut rewritten = kept.join("\n");
            if !rewritten.is_empty() {
                rewritten.push('\n');
            }
            match persist::write_atomic(path, rewritten.as_bytes()) {
                Ok(()) => debug!(provider, expired, "pruned rate limit log"),
                Err(e) => warn!(provider, error = %e, "failed to prune rate limit log"),
            }
        }

        usage
    }

    /// Take `tokens` from the provider's bucket.
    ///
    /// Non-blocking calls fail immediately with [`AskError::RateLimited`]
    /// when the bucket is short. Blocking calls sleep in slices of at most
    /// 50 ms until the tokens are available or `timeout` elapses (`None`
    /// waits indefinitely).
    pub fn acquire(
        &self,
        provider: &str,
        tokens: f64,
        block: bool,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let provider = provider.to_lowercase();
        let deadline = timeout.map(|t| self.clock.now() + t.as_secs_f64());

        loop {
            let wait = {
                let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
                let now = self.clock.now();
                let bucket = buckets
                    .entry(provider.clone())
                    .or_insert_with(|| self.load_bucket(&provider, now));
                bucket.refill(now);
                if bucket.try_take(tokens) {
                    self.save_bucket(&provider, bucket);
                    self.record_event(&provider, tokens, "acquired");
                    debug!(provider = %provider, remaining = bucket.tokens, "rate limit token acquired");
                    return Ok(());
                }
                self.save_bucket(&provider, bucket);
                bucket.wait_for(tokens)
            };

            let remaining = deadline.map(|d| d - self.clock.now());
            let hopeless = wait.is_infinite() && tokens > self.config_for(&provider).burst;
            if !block || hopeless || remaining.is_some_and(|r| r <= 0.0) {
                self.record_event(&provider, tokens, "limited");
                return Err(AskError::RateLimited {
                    provider,
                    retry_after_s: wait,
                });
            }

            let slice = wait
                .min(SLEEP_SLICE_S)
                .min(remaining.unwrap_or(f64::INFINITY))
                .max(0.001);
            self.clock.sleep(Duration::from_secs_f64(slice));
        }
    }

    /// Current bucket state after refilling
    pub fn status(&self, provider: &str) -> TokenBucketState {
        let provider = provider.to_lowercase();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let now = self.clock.now();
        let bucket = buckets
            .entry(provider.clone())
            .or_insert_with(|| self.load_bucket(&provider, now));
        bucket.refill(now);
        bucket.clone()
    }

    /// Requests, tokens and limited events in the trailing 60 seconds
    pub fn usage(&self, provider: &str) -> WindowUsage {
        let provider = provider.to_lowercase();
        match self.log_path(&provider) {
            Some(path) => self.scan_log(&provider, &path),
            None => WindowUsage::default(),
        }
    }
}
