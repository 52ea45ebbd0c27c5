//! Live progress publishing
//!
//! The orchestrator mutates the snapshot through a `watch` channel; a
//! persister task writes the latest value to the sync store whenever it
//! changes. Intermediate values may be skipped, the last one never is.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::models::{SyncPhase, SyncProgress};
use crate::state::SyncStore;

/// Errors kept on the snapshot; older ones are only in the logs
const MAX_RECORDED_ERRORS: usize = 100;

fn phase_rank(phase: SyncPhase) -> u8 {
    match phase {
        SyncPhase::Idle => 0,
        SyncPhase::Listing => 1,
        SyncPhase::Downloading => 2,
        SyncPhase::Parsing => 3,
        SyncPhase::Importing => 4,
        SyncPhase::Indexing => 5,
        SyncPhase::Completed | SyncPhase::Failed => 6,
    }
}

pub struct ProgressTracker {
    sender: watch::Sender<SyncProgress>,
    persister: JoinHandle<()>,
}

impl ProgressTracker {
    /// Publish `initial` and start persisting changes to `store`
    pub fn start(initial: SyncProgress, store: Arc<dyn SyncStore>) -> Self {
        let (sender, mut receiver) = watch::channel(initial);

        let persister = tokio::spawn(async move {
            loop {
                let snapshot = receiver.borrow_and_update().clone();
                if let Err(e) = store.put_progress(&snapshot).await {
                    warn!(run_id = %snapshot.run_id, error = %e, "Failed to persist sync progress");
                }
                if receiver.changed().await.is_err() {
                    break;
                }
            }
        });

        Self { sender, persister }
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.sender.borrow().clone()
    }

    pub fn update(&self, f: impl FnOnce(&mut SyncProgress)) {
        self.sender.send_modify(|progress| {
            f(progress);
            progress.updated_at = Utc::now();
        });
    }

    /// Move the phase forward; never backwards while files overlap
    pub fn advance(&self, phase: SyncPhase) {
        self.sender.send_if_modified(|progress| {
            if phase_rank(phase) <= phase_rank(progress.phase) {
                return false;
            }
            progress.phase = phase;
            progress.updated_at = Utc::now();
            true
        });
    }

    pub fn record_error(&self, message: String) {
        self.update(|progress| {
            if progress.errors.len() < MAX_RECORDED_ERRORS {
                progress.errors.push(message);
            }
        });
    }

    /// Stop publishing and wait until the final snapshot is persisted
    pub async fn finish(self) -> SyncProgress {
        let last = self.snapshot();
        drop(self.sender);
        if let Err(e) = self.persister.await {
            warn!(error = %e, "Progress persister task failed");
        }
        last
    }
}
