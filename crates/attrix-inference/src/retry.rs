//! Retry/backoff policy for vision calls.
//!
//! The policy is plain data; [`RetryPolicy::run`] is the only retry loop in
//! the workspace. Only errors whose [`attrix_core::Error::is_retryable`] is
//! true are retried. Backoff is linear (`attempt × base_delay`), except that
//! a rate-limited *first* attempt waits a fixed pause instead.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use attrix_core::defaults::{RETRY_BASE_DELAY_MS, RETRY_MAX_ATTEMPTS, RETRY_RATE_LIMIT_PAUSE_MS};
use attrix_core::Result;

/// Retry/backoff parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Linear backoff unit.
    pub base_delay: Duration,
    /// Fixed pause used instead of backoff when attempt 1 is rate limited.
    /// `None` disables the rule.
    pub rate_limit_pause: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RETRY_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
            rate_limit_pause: Some(Duration::from_millis(RETRY_RATE_LIMIT_PAUSE_MS)),
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `ATTRIX_RETRY_MAX_ATTEMPTS` | `3` | Attempts per call |
    /// | `ATTRIX_RETRY_BASE_DELAY_MS` | `1000` | Linear backoff unit |
    /// | `ATTRIX_RETRY_RATE_LIMIT_PAUSE_MS` | `2000` | First-attempt 429 pause (`0` disables) |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_attempts = std::env::var("ATTRIX_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(defaults.max_attempts)
            .max(1);
        let base_delay = std::env::var("ATTRIX_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);
        let rate_limit_pause = match std::env::var("ATTRIX_RETRY_RATE_LIMIT_PAUSE_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.rate_limit_pause,
        };
        Self {
            max_attempts,
            base_delay,
            rate_limit_pause,
        }
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_rate_limit_pause(mut self, pause: Option<Duration>) -> Self {
        self.rate_limit_pause = pause;
        self
    }

    /// Delay to wait after `attempt` (1-based) failed with an error whose
    /// rate-limit flag is `rate_limited`.
    pub fn delay_after(&self, attempt: u32, rate_limited: bool) -> Duration {
        match self.rate_limit_pause {
            Some(pause) if attempt == 1 && rate_limited => pause,
            _ => self.base_delay.saturating_mul(attempt),
        }
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt budget
    /// is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    debug!(attempt, error = %e, "Terminal failure, not retrying");
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    warn!(attempt, error = %e, "Retry budget exhausted");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.delay_after(attempt, e.is_rate_limited());
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
