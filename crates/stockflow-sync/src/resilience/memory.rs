//! Resident-memory watchdog
//!
//! Sampled before every batch pull and before the worker claims new work.
//! Above the ceiling the watchdog runs its release hooks (dropping caches the
//! process can rebuild) and then blocks the caller, re-sampling every
//! interval, until usage falls back under the ceiling.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

use super::SyncMetrics;
use crate::config::MemoryConfig;
use crate::error::{SyncError, SyncResult};

/// Source of the current resident set size
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> u64;
}

/// Reads this process' RSS through `sysinfo`
pub struct SysinfoProbe {
    pid: Pid,
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> SyncResult<Self> {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| SyncError::Config(format!("cannot determine own pid: {}", e)))?;
        Ok(Self {
            pid,
            system: Mutex::new(System::new()),
        })
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_bytes(&self) -> u64 {
        let mut system = self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_process(self.pid);
        system.process(self.pid).map(|p| p.memory()).unwrap_or(0)
    }
}

type ReleaseHook = Box<dyn Fn() + Send + Sync>;

pub struct MemoryWatchdog {
    probe: Arc<dyn MemoryProbe>,
    ceiling_bytes: u64,
    interval: Duration,
    release_hooks: Mutex<Vec<(String, ReleaseHook)>>,
    metrics: Arc<SyncMetrics>,
}

impl MemoryWatchdog {
    pub fn new(probe: Arc<dyn MemoryProbe>, config: &MemoryConfig, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            probe,
            ceiling_bytes: config.ceiling_bytes(),
            interval: config.check_interval(),
            release_hooks: Mutex::new(Vec::new()),
            metrics,
        }
    }

    /// Register something to drop when memory runs high
    pub fn register_release_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.release_hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((name.into(), Box::new(hook)));
    }

    fn release(&self) {
        let hooks = self.release_hooks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (name, hook) in hooks.iter() {
            debug!(hook = %name, "Running memory release hook");
            hook();
        }
    }

    /// Block until resident memory is under the ceiling
    ///
    /// Returns immediately (with `false`) when already under; returns `true`
    /// after a pause.
    pub async fn wait_until_below(&self) -> bool {
        let resident = self.probe.resident_bytes();
        if resident <= self.ceiling_bytes {
            return false;
        }

        self.metrics.inc_watchdog_pauses();
        warn!(
            resident_mb = resident / (1024 * 1024),
            ceiling_mb = self.ceiling_bytes / (1024 * 1024),
            "Memory above ceiling, pausing ingestion"
        );
        self.release();

        let started = tokio::time::Instant::now();
        loop {
            tokio::time::sleep(self.interval).await;
            let resident = self.probe.resident_bytes();
            if resident <= self.ceiling_bytes {
                info!(
                    resident_mb = resident / (1024 * 1024),
                    paused_ms = started.elapsed().as_millis() as u64,
                    "Memory back under ceiling, resuming"
                );
                return true;
            }
            debug!(resident_mb = resident / (1024 * 1024), "Still above memory ceiling");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    struct FixedProbe(AtomicU64);

    impl MemoryProbe for FixedProbe {
        fn resident_bytes(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn watchdog(probe: Arc<FixedProbe>) -> MemoryWatchdog {
        MemoryWatchdog::new(
            probe,
            &MemoryConfig {
                ceiling_mb: 100,
                check_interval_ms: 50,
            },
            Arc::new(SyncMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_under_ceiling_does_not_pause() {
        let probe = Arc::new(FixedProbe(AtomicU64::new(10 * 1024 * 1024)));
        let watchdog = watchdog(probe);
        assert!(!watchdog.wait_until_below().await);
        assert_eq!(watchdog.metrics.snapshot().watchdog_pauses, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_release_hooks_and_resumes() {
        let probe = Arc::new(FixedProbe(AtomicU64::new(200 * 1024 * 1024)));
        let watchdog = watchdog(probe.clone());

        let released = Arc::new(AtomicBool::new(false));
        let hook_probe = probe.clone();
        let hook_flag = released.clone();
        watchdog.register_release_hook("count-cache", move || {
            hook_flag.store(true, Ordering::SeqCst);
            hook_probe.0.store(50 * 1024 * 1024, Ordering::SeqCst);
        });

        assert!(watchdog.wait_until_below().await);
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(watchdog.metrics.snapshot().watchdog_pauses, 1);
    }

    #[test]
    fn test_sysinfo_probe_reports_this_process() {
        let probe = SysinfoProbe::new().unwrap();
        assert!(probe.resident_bytes() > 0);
    }
}
