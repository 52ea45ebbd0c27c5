//! Sync worker poll loop
//!
//! A single long-lived loop: wait out an open document-store breaker and
//! memory pressure, purge stale progress snapshots, claim the oldest pending
//! request and run it. One run at a time per process.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncOrchestrator;
use crate::error::SyncResult;
use crate::models::RunHistory;

pub struct SyncWorker {
    orchestrator: Arc<SyncOrchestrator>,
}

impl SyncWorker {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Poll until `cancel` fires; an in-flight run stops between batches
    pub async fn run(&self, cancel: CancellationToken) {
        let poll_interval = self.orchestrator.config().worker.poll_interval();
        info!(poll_interval_secs = poll_interval.as_secs(), "Sync worker started");

        while !cancel.is_cancelled() {
            let idle = match self.poll_once(&cancel).await {
                Ok(Some(history)) => {
                    debug!(run_id = %history.run_id, status = history.status.as_str(), "Run finished");
                    false
                },
                Ok(None) => true,
                Err(e) => {
                    warn!(error = %e, "Sync worker poll failed");
                    true
                },
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {},
                    _ = cancel.cancelled() => break,
                }
            }
        }

        info!("Sync worker stopped");
    }

    /// Claim and run at most one pending request
    pub async fn poll_once(&self, cancel: &CancellationToken) -> SyncResult<Option<RunHistory>> {
        let breaker = self.orchestrator.writer().doc_breaker();
        while let Some(wait) = breaker.retry_after() {
            info!(
                dependency = breaker.dependency(),
                wait_ms = wait.as_millis() as u64,
                "Document store breaker open, holding new runs"
            );
            tokio::select! {
                _ = tokio::time::sleep(wait) => {},
                _ = cancel.cancelled() => return Ok(None),
            }
        }

        tokio::select! {
            _ = self.orchestrator.watchdog().wait_until_below() => {},
            _ = cancel.cancelled() => {},
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let state = self.orchestrator.state();
        let retention = self.orchestrator.config().worker.progress_retention();
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
        match state.purge_progress(cutoff).await {
            Ok(0) => {},
            Ok(purged) => debug!(purged, "Purged finished progress snapshots"),
            Err(e) => warn!(error = %e, "Failed to purge progress snapshots"),
        }

        let Some(request) = state.claim_next_request().await? else {
            return Ok(None);
        };
        info!(request_id = %request.id, integration_id = %request.integration_id, "Claimed sync request");

        let history = self.orchestrator.run_request(&request, cancel).await?;
        Ok(Some(history))
    }
}
