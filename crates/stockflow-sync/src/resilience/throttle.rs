//! Rate limiting for repeated warnings
//!
//! A multi-hour run against a flaky index can produce the same warning for
//! every batch. Call sites ask [`LogThrottle::should_emit`] with a stable key
//! and log only when it answers, including the number of suppressed repeats.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    last_emitted: Instant,
    suppressed: u64,
}

pub struct LogThrottle {
    window: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl LogThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `Some(suppressed)` when the message for `key` should be logged now
    pub fn should_emit(&self, key: &str) -> Option<u64> {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_emitted) < self.window => {
                entry.suppressed += 1;
                None
            },
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_emitted = now;
                entry.suppressed = 0;
                Some(suppressed)
            },
            None => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        last_emitted: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_suppresses_within_window_and_reports_count() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert_eq!(throttle.should_emit("es-bulk"), Some(0));
        assert_eq!(throttle.should_emit("es-bulk"), None);
        assert_eq!(throttle.should_emit("es-bulk"), None);
        assert_eq!(throttle.should_emit("db-upsert"), Some(0));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(throttle.should_emit("es-bulk"), Some(2));
        assert_eq!(throttle.should_emit("es-bulk"), None);
    }
}
