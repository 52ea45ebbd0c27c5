//! Resilience layer wrapped around every call leaving the process
//!
//! - [`CircuitBreaker`]: one per downstream dependency
//! - [`RetryPolicy`]: exponential backoff with jitter, also used for 429s
//! - [`MemoryWatchdog`]: pauses ingestion above the resident-memory ceiling
//! - [`LogThrottle`]: collapses repeated warnings
//! - [`SyncMetrics`]: counters the above report into

pub mod backoff;
pub mod circuit_breaker;
pub mod memory;
pub mod throttle;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use memory::{MemoryProbe, MemoryWatchdog, SysinfoProbe};
pub use throttle::LogThrottle;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide resilience counters
#[derive(Debug, Default)]
pub struct SyncMetrics {
    retries: AtomicU64,
    rate_limited: AtomicU64,
    breaker_rejections: AtomicU64,
    watchdog_pauses: AtomicU64,
}

/// Point-in-time copy of [`SyncMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub retries: u64,
    pub rate_limited: u64,
    pub breaker_rejections: u64,
    pub watchdog_pauses: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_breaker_rejections(&self) {
        self.breaker_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_watchdog_pauses(&self) {
        self.watchdog_pauses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            retries: self.retries.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            breaker_rejections: self.breaker_rejections.load(Ordering::Relaxed),
            watchdog_pauses: self.watchdog_pauses.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Counters accumulated since `earlier`
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            retries: self.retries.saturating_sub(earlier.retries),
            rate_limited: self.rate_limited.saturating_sub(earlier.rate_limited),
            breaker_rejections: self.breaker_rejections.saturating_sub(earlier.breaker_rejections),
            watchdog_pauses: self.watchdog_pauses.saturating_sub(earlier.watchdog_pauses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_delta() {
        let metrics = SyncMetrics::new();
        metrics.inc_retries();
        let before = metrics.snapshot();
        metrics.inc_retries();
        metrics.inc_rate_limited();
        let delta = metrics.snapshot().since(&before);
        assert_eq!(delta.retries, 1);
        assert_eq!(delta.rate_limited, 1);
        assert_eq!(delta.watchdog_pauses, 0);
    }
}
