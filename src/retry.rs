//! Bounded retry with exponential backoff for storage calls.
//!
//! Every attempt runs under a timeout; a timed-out attempt counts as
//! `StoreError::Unavailable`. Only transient errors are retried, definite
//! answers (`Full`, `NotFound`, `Duplicate`, ...) return immediately.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::store::StoreError;

/// Defaults: 4 attempts, 20ms initial delay doubling up to 1s, 2s per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1).
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff. Used where a caller handles failure itself.
    pub fn once(attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let delay_ms = self.initial_delay.as_millis() as f64 * factor;
        let delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);
        delay.min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails definitively, or attempts run out.
    pub async fn run<T, F, Fut>(&self, op: &'static str, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let result = match timeout(self.attempt_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Unavailable(format!(
                    "{op} timed out after {}ms",
                    self.attempt_timeout.as_millis()
                ))),
            };
            match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(op, attempt, "store call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %e, "store call failed, retrying");
                    metrics::counter!(crate::observability::STORE_RETRIES_TOTAL, "op" => op)
                        .increment(1);
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
