//! Per-dependency circuit breaker
//!
//! Closed until `failure_threshold` consecutive connection-level failures,
//! then open for a cooldown during which calls fail fast with
//! [`SyncError::CircuitOpen`]. The first call after the cooldown is a
//! half-open probe: success closes the breaker, failure reopens it with the
//! cooldown doubled (capped at `max_cooldown`).

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::SyncMetrics;
use crate::config::BreakerConfig;
use crate::error::{SyncError, SyncResult};

/// How long concurrent callers wait while a half-open probe is in flight
const PROBE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    dependency: String,
    failure_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    inner: Mutex<BreakerState>,
    metrics: Arc<SyncMetrics>,
}

impl CircuitBreaker {
    pub fn new(dependency: impl Into<String>, config: &BreakerConfig, metrics: Arc<SyncMetrics>) -> Self {
        let base_cooldown = Duration::from_secs(config.cooldown_secs);
        Self {
            dependency: dependency.into(),
            failure_threshold: config.failure_threshold.max(1),
            base_cooldown,
            max_cooldown: Duration::from_secs(config.max_cooldown_secs).max(base_cooldown),
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                cooldown: base_cooldown,
                probe_in_flight: false,
            }),
            metrics,
        }
    }

    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // A panic while holding the lock leaves plain counters behind; keep going.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Time left before an open breaker lets a probe through, `None` otherwise
    pub fn retry_after(&self) -> Option<Duration> {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                let remaining = inner.cooldown.saturating_sub(opened_at.elapsed());
                (!remaining.is_zero()).then_some(remaining)
            },
            _ => None,
        }
    }

    /// Run `operation` through the breaker
    ///
    /// Returns [`SyncError::CircuitOpen`] without calling `operation` while
    /// the breaker is open.
    pub async fn call<T, F, Fut>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        self.acquire()?;
        let mut slot = HalfOpenSlot {
            breaker: self,
            settled: false,
        };

        let result = operation().await;
        slot.settled = true;
        match &result {
            Err(e) if e.counts_against_breaker() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }

    fn acquire(&self) -> SyncResult<()> {
        let mut inner = self.lock();
        let state = inner.state;
        match state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= inner.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    info!(dependency = %self.dependency, "Circuit breaker half-open, sending probe");
                    Ok(())
                } else {
                    let remaining = inner.cooldown.saturating_sub(elapsed);
                    drop(inner);
                    self.metrics.inc_breaker_rejections();
                    Err(self.open_error(remaining))
                }
            },
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    self.metrics.inc_breaker_rejections();
                    Err(self.open_error(PROBE_WAIT.min(self.base_cooldown)))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            },
        }
    }

    #[cfg(test)]
    fn current_cooldown(&self) -> Duration {
        self.lock().cooldown
    }

    fn open_error(&self, retry_after: Duration) -> SyncError {
        SyncError::CircuitOpen {
            dependency: self.dependency.clone(),
            retry_after,
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state != CircuitState::Closed {
            info!(dependency = %self.dependency, "Circuit breaker closed");
        }
        inner.state = CircuitState::Closed;
        inner.opened_at = None;
        inner.cooldown = self.base_cooldown;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let state = inner.state;
        match state {
            CircuitState::HalfOpen => {
                inner.cooldown = (inner.cooldown * 2).min(self.max_cooldown);
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                warn!(
                    dependency = %self.dependency,
                    cooldown_secs = inner.cooldown.as_secs_f64(),
                    "Circuit breaker probe failed, reopening"
                );
            },
            CircuitState::Closed if inner.consecutive_failures >= self.failure_threshold => {
                inner.cooldown = self.base_cooldown;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    dependency = %self.dependency,
                    failures = inner.consecutive_failures,
                    cooldown_secs = inner.cooldown.as_secs_f64(),
                    "Circuit breaker opened"
                );
            },
            _ => {},
        }
    }
}

/// Frees the half-open slot when a call is dropped before it finishes
struct HalfOpenSlot<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cooldown_secs: u64, max_cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "document-store",
            &BreakerConfig {
                failure_threshold: threshold,
                cooldown_secs,
                max_cooldown_secs,
            },
            Arc::new(SyncMetrics::new()),
        )
    }

    async fn fail(breaker: &CircuitBreaker) -> SyncResult<()> {
        breaker
            .call(|| async { Err::<(), _>(SyncError::connection("db", "connection refused")) })
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_short_circuits() {
        let breaker = breaker(3, 30, 300);
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let calls = &AtomicU32::new(0);
        let result = breaker
            .call(move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.metrics.snapshot().breaker_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_success_closes() {
        let breaker = breaker(1, 10, 60);
        assert!(fail(&breaker).await.is_err());
        assert!(breaker.retry_after().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(breaker.retry_after().is_none());
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_doubles_cooldown_up_to_cap() {
        let breaker = breaker(1, 10, 30);
        assert!(fail(&breaker).await.is_err());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.current_cooldown(), Duration::from_secs(20));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.current_cooldown(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_half_open_call_frees_the_slot() {
        let breaker = breaker(1, 10, 60);
        assert!(fail(&breaker).await.is_err());
        tokio::time::advance(Duration::from_secs(11)).await;

        let stalled = breaker.call(|| std::future::pending::<SyncResult<()>>());
        assert!(tokio::time::timeout(Duration::from_millis(5), stalled).await.is_err());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics.snapshot().breaker_rejections, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_does_not_trip() {
        let breaker = breaker(1, 10, 60);
        let result = breaker
            .call(|| async {
                Err::<(), _>(SyncError::RateLimited {
                    target: "es".into(),
                    retry_after: None,
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
