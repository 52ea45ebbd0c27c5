//! Sync orchestrator
//!
//! Drives one integration through
//! `idle → listing → downloading → parsing → importing → indexing → completed`
//! (or `failed` from anywhere):
//!
//! 1. Claim the integration in the [`RunRegistry`]
//! 2. List the source, then process files with bounded fan-out; each file is
//!    downloaded, streamed through the normalizer in batches and written to
//!    both stores
//! 3. Refresh the search index
//! 4. Persist the final progress, a history record and the integration's
//!    status/stats
//!
//! Per-file failures are recorded and the run moves on. Fatal errors
//! (authentication, retry exhaustion, missing or disabled integration,
//! cancellation) stop the remaining files between batches and fail the run.

pub mod progress;
pub mod registry;
pub mod worker;

pub use progress::ProgressTracker;
pub use registry::{RunGuard, RunRegistry};
pub use worker::SyncWorker;

use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connector::{build_connector, spool_path, ConnectorSettings, FileDescriptor, SourceConnector};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    Integration, IntegrationStatus, LastSync, RequestStatus, RunHistory, SyncPhase, SyncProgress, SyncRequest,
};
use crate::normalize::{ApiRecordStream, Batcher, CsvRecordStream, NormalizeContext, RecordStream};
use crate::resilience::{MemoryProbe, MemoryWatchdog, RetryPolicy, SyncMetrics};
use crate::state::SyncStore;
use crate::store::{DocumentStore, SearchIndex};
use crate::writer::BatchWriter;

/// External collaborators of the orchestrator
pub struct SyncDependencies {
    pub state: Arc<dyn SyncStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub search: Arc<dyn SearchIndex>,
    pub memory_probe: Arc<dyn MemoryProbe>,
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    state: Arc<dyn SyncStore>,
    writer: BatchWriter,
    retry: RetryPolicy,
    watchdog: Arc<MemoryWatchdog>,
    metrics: Arc<SyncMetrics>,
    registry: RunRegistry,
}

impl SyncOrchestrator {
    pub fn new(config: SyncConfig, deps: SyncDependencies) -> Self {
        let metrics = Arc::new(SyncMetrics::new());

        let watchdog = Arc::new(MemoryWatchdog::new(deps.memory_probe, &config.memory, metrics.clone()));
        let search = deps.search.clone();
        watchdog.register_release_hook("search count cache", move || search.release_caches());

        let writer = BatchWriter::new(deps.documents, deps.search, &config, metrics.clone());
        let retry = RetryPolicy::new(&config.retry, metrics.clone());

        Self {
            config,
            state: deps.state,
            writer,
            retry,
            watchdog,
            metrics,
            registry: RunRegistry::new(),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<dyn SyncStore> {
        &self.state
    }

    pub fn writer(&self) -> &BatchWriter {
        &self.writer
    }

    pub fn watchdog(&self) -> &Arc<MemoryWatchdog> {
        &self.watchdog
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Run one claimed request to completion
    ///
    /// A run that started always yields its [`RunHistory`], failed or not;
    /// the error variant is for requests that never started
    /// ([`SyncError::AlreadySyncing`]) and for failures persisting the
    /// outcome.
    pub async fn run_request(&self, request: &SyncRequest, cancel: &CancellationToken) -> SyncResult<RunHistory> {
        let integration_id = request.integration_id;
        let run_id = request.id;

        let _guard = match self.registry.try_acquire(integration_id) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(run_id = %run_id, integration_id = %integration_id, "Rejecting concurrent sync request");
                self.state
                    .finish_request(run_id, RequestStatus::Failed, Some(e.to_string()))
                    .await?;
                return Err(e);
            },
        };

        info!(run_id = %run_id, integration_id = %integration_id, "Starting sync run");
        let metrics_before = self.metrics.snapshot();
        let tracker = ProgressTracker::start(SyncProgress::new(run_id, integration_id), self.state.clone());

        let (integration, result) = match self.load_integration(integration_id).await {
            Ok(mut integration) => {
                integration.status = IntegrationStatus::Syncing;
                if let Err(e) = self.state.save_integration(&integration).await {
                    warn!(integration_id = %integration_id, error = %e, "Failed to mark integration as syncing");
                }
                let result = self.execute(&integration, run_id, &tracker, cancel).await;
                (Some(integration), result)
            },
            Err(e) => (None, Err(e)),
        };

        let cause = result.as_ref().err().map(|e| e.to_string());
        let status = if result.is_ok() {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };

        tracker.update(|p| {
            p.status = status;
            p.phase = if result.is_ok() {
                SyncPhase::Completed
            } else {
                SyncPhase::Failed
            };
            p.current_file = None;
        });
        let final_progress = tracker.finish().await;
        let history = RunHistory::from_progress(&final_progress, cause.clone());

        self.state.append_history(&history).await?;
        self.state.finish_request(run_id, status, cause.clone()).await?;
        if let Some(integration) = integration {
            self.record_outcome(integration, &history).await?;
        }

        let delta = self.metrics.snapshot().since(&metrics_before);
        match &cause {
            None => info!(
                run_id = %run_id,
                files = history.files_processed,
                records = history.records_processed,
                inserted = history.records_inserted,
                updated = history.records_updated,
                rejected = history.records_rejected,
                index_failures = history.index_failures,
                retries = delta.retries,
                rate_limited = delta.rate_limited,
                breaker_rejections = delta.breaker_rejections,
                watchdog_pauses = delta.watchdog_pauses,
                duration_secs = history.duration_secs,
                "Sync run completed"
            ),
            Some(cause) => error!(
                run_id = %run_id,
                cause = %cause,
                records = history.records_processed,
                retries = delta.retries,
                breaker_rejections = delta.breaker_rejections,
                duration_secs = history.duration_secs,
                "Sync run failed"
            ),
        }

        Ok(history)
    }

    async fn load_integration(&self, integration_id: Uuid) -> SyncResult<Integration> {
        let integration = self
            .state
            .get_integration(integration_id)
            .await?
            .ok_or(SyncError::IntegrationNotFound(integration_id))?;
        if !integration.enabled {
            return Err(SyncError::IntegrationDisabled(integration_id));
        }
        Ok(integration)
    }

    /// Status, last-sync summary and cumulative stats, applied to the latest
    /// stored copy of the integration
    async fn record_outcome(&self, started_with: Integration, history: &RunHistory) -> SyncResult<()> {
        let mut integration = self
            .state
            .get_integration(started_with.id)
            .await?
            .unwrap_or(started_with);

        integration.status = if history.status == RequestStatus::Completed {
            IntegrationStatus::Idle
        } else {
            IntegrationStatus::Error
        };
        integration.last_sync = Some(LastSync {
            run_id: history.run_id,
            status: history.status,
            finished_at: history.finished_at,
            records_processed: history.records_processed,
            error: history.cause.clone(),
        });
        integration.stats.record_run(history);
        self.state.save_integration(&integration).await
    }

    async fn execute(
        &self,
        integration: &Integration,
        run_id: Uuid,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let cache_dir = self.config.worker.cache_dir.join(run_id.to_string());
        tokio::fs::create_dir_all(&cache_dir).await?;

        let result = self.ingest(integration, &cache_dir, tracker, cancel).await;

        if let Err(e) = tokio::fs::remove_dir_all(&cache_dir).await {
            debug!(path = %cache_dir.display(), error = %e, "Could not remove run cache directory");
        }
        result
    }

    async fn ingest(
        &self,
        integration: &Integration,
        cache_dir: &Path,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        tracker.advance(SyncPhase::Listing);
        let connector = build_connector(
            &integration.source,
            &ConnectorSettings {
                cache_dir: cache_dir.to_path_buf(),
                connect_timeout: self.config.worker.source_connect_timeout(),
                request_timeout: self.config.worker.source_request_timeout(),
            },
        )?;

        let files = self.retry.run("list source", || connector.list()).await?;
        tracker.update(|p| p.files_total = files.len() as u64);
        info!(
            integration = %integration.name,
            source = connector.kind(),
            files = files.len(),
            "Listed source files"
        );

        tracker.advance(SyncPhase::Downloading);
        let abort = cancel.child_token();
        let mut fatal: Option<SyncError> = None;

        let (connector_ref, abort_ref) = (&connector, &abort);
        let mut outcomes = stream::iter(files)
            .map(move |file| async move {
                let result = self.process_file(connector_ref, integration, &file, tracker, abort_ref).await;
                discard_spool(cache_dir, &file.name).await;
                (file, result)
            })
            .buffer_unordered(self.config.worker.download_concurrency.max(1));

        while let Some((file, result)) = outcomes.next().await {
            match result {
                Ok(()) => tracker.update(|p| p.files_processed += 1),
                Err(e) if e.is_fatal() => {
                    if fatal.is_none() {
                        error!(file = %file.name, error = %e, "Fatal error, stopping remaining files");
                        abort.cancel();
                        fatal = Some(e);
                    } else {
                        debug!(file = %file.name, error = %e, "File stopped after abort");
                    }
                },
                Err(e) => {
                    warn!(file = %file.name, error = %e, "File failed, continuing with the rest");
                    tracker.update(|p| p.files_failed += 1);
                    tracker.record_error(format!("{}: {}", file.name, e));
                },
            }
        }
        drop(outcomes);

        if let Some(e) = fatal {
            return Err(e);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled("worker shutting down".to_string()));
        }

        tracker.advance(SyncPhase::Indexing);
        let search = self.writer.search();
        if let Err(e) = self.retry.run("refresh search index", || search.refresh()).await {
            warn!(error = %e, "Search index refresh failed; documents become visible on the next refresh");
            tracker.record_error(format!("search index refresh: {}", e));
        }
        Ok(())
    }

    async fn process_file(
        &self,
        connector: &Arc<dyn SourceConnector>,
        integration: &Integration,
        file: &FileDescriptor,
        tracker: &ProgressTracker,
        abort: &CancellationToken,
    ) -> SyncResult<()> {
        if abort.is_cancelled() {
            return Err(SyncError::Cancelled(format!("{} not started", file.name)));
        }
        tracker.update(|p| p.current_file = Some(file.name.clone()));

        let context = NormalizeContext::new(integration.id, &integration.name, &file.name).with_defaults(
            integration
                .default_currency
                .clone()
                .unwrap_or_else(|| self.config.worker.default_currency.clone()),
            integration.default_supplier.clone(),
            self.config.worker.low_stock_threshold,
        );

        let stream: Box<dyn RecordStream> = if connector.is_paginated() {
            Box::new(ApiRecordStream::new(
                connector.clone(),
                self.retry.clone(),
                context,
                integration.column_overrides.clone(),
            ))
        } else {
            debug!(file = %file.name, size = file.size, "Downloading");
            let bytes = self.retry.run("download", || connector.download(file)).await?;
            tracker.advance(SyncPhase::Parsing);
            Box::new(CsvRecordStream::open(bytes, context, &integration.column_overrides).await?)
        };

        let mut batcher = Batcher::new(stream, self.config.batch.batch_size);
        let mut batches: u64 = 0;
        let mut rows: u64 = 0;

        loop {
            tokio::select! {
                _ = self.watchdog.wait_until_below() => {},
                _ = abort.cancelled() => {},
            }
            if abort.is_cancelled() {
                return Err(SyncError::Cancelled(format!("{} stopped after {} batches", file.name, batches)));
            }

            let Some(batch) = batcher.next_batch().await? else {
                break;
            };
            batches += 1;
            tracker.advance(SyncPhase::Importing);

            let batch_rows = batch.rows();
            let rejected = batch.rejected;
            rows += batch_rows;

            let report = self.writer.write(batch.records).await;
            tracker.update(|p| {
                p.records_processed += batch_rows;
                p.records_rejected += rejected;
                p.records_inserted += report.inserted;
                p.records_updated += report.updated;
                p.records_indexed += report.indexed;
                p.index_failures += report.index_failed;
            });

            if let Some(e) = report.doc_error {
                if e.is_fatal() {
                    return Err(e);
                }
                tracker.record_error(format!("{}: batch {}: {}", file.name, batches, e));
            }
        }

        info!(file = %file.name, batches, rows, "Finished file");
        Ok(())
    }
}

/// Remove a file's spooled download once the file is done with
async fn discard_spool(cache_dir: &Path, name: &str) {
    let spooled = spool_path(cache_dir, name);
    match tokio::fs::remove_file(&spooled).await {
        Ok(()) => debug!(path = %spooled.display(), "Removed spooled download"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %spooled.display(), error = %e, "Could not remove spooled download"),
    }
}
