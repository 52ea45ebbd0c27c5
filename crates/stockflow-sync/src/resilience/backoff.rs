//! Exponential backoff with jitter
//!
//! `delay = min(base * 2^attempt, max)`, then scaled by a random factor in
//! `[0.5, 1.0]` so that concurrent file tasks hitting the same outage do not
//! retry in lockstep.

use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::SyncMetrics;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};

#[derive(Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
    wait_on_open_breaker: bool,
    metrics: Arc<SyncMetrics>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_retries: config.max_retries,
            wait_on_open_breaker: false,
            metrics,
        }
    }

    /// Also treat [`SyncError::CircuitOpen`] as retryable, sleeping out the
    /// breaker's remaining cooldown
    pub fn waiting_on_open_breaker(mut self) -> Self {
        self.wait_on_open_breaker = true;
        self
    }

    /// Upper bound of the delay before retry number `attempt` (0-based)
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Jittered delay before retry number `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        self.ceiling(attempt).mul_f64(jitter)
    }

    fn should_retry(&self, err: &SyncError) -> bool {
        err.is_retryable() || (self.wait_on_open_breaker && matches!(err, SyncError::CircuitOpen { .. }))
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of retries
    ///
    /// Exhaustion is reported as [`SyncError::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.should_retry(&err) {
                return Err(err);
            }

            if attempt >= self.max_retries {
                return Err(SyncError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt + 1,
                    last_error: err.to_string(),
                });
            }

            let delay = match &err {
                SyncError::RateLimited {
                    retry_after: Some(hint),
                    ..
                } => (*hint).min(self.max_delay),
                SyncError::CircuitOpen { retry_after, .. } => *retry_after,
                _ => self.delay(attempt),
            };

            if err.is_rate_limited() {
                self.metrics.inc_rate_limited();
            }
            self.metrics.inc_retries();

            warn!(
                operation,
                attempt = attempt + 1,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            debug!(operation, attempt, "Retry attempt starting");
        }
    }
}
