//! Dual-store batch writer
//!
//! Each batch goes to the document store (one bulk upsert) and to the search
//! index (re-chunked into smaller bulk calls with a pause in between). The
//! two writes run side by side and fail independently: a search outage never
//! changes the document-store counts and vice versa.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::PartRecord;
use crate::resilience::{CircuitBreaker, LogThrottle, RetryPolicy, SyncMetrics};
use crate::store::{BulkIndexReport, DocumentStore, SearchIndex, UpsertCounts};

/// What happened to one batch
#[derive(Debug, Default)]
pub struct BatchReport {
    pub inserted: u64,
    pub updated: u64,
    pub indexed: u64,
    pub index_failed: u64,
    /// Set when the document-store write failed for the whole batch
    pub doc_error: Option<SyncError>,
}

pub struct BatchWriter {
    documents: Arc<dyn DocumentStore>,
    search: Arc<dyn SearchIndex>,
    doc_breaker: Arc<CircuitBreaker>,
    search_breaker: Arc<CircuitBreaker>,
    doc_retry: RetryPolicy,
    search_retry: RetryPolicy,
    search_batch_size: usize,
    search_batch_pause: Duration,
    throttle: LogThrottle,
}

impl BatchWriter {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        search: Arc<dyn SearchIndex>,
        config: &SyncConfig,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            doc_breaker: Arc::new(CircuitBreaker::new(documents.name(), &config.breaker, metrics.clone())),
            search_breaker: Arc::new(CircuitBreaker::new(search.name(), &config.breaker, metrics.clone())),
            documents,
            search,
            doc_retry: RetryPolicy::new(&config.retry, metrics.clone()).waiting_on_open_breaker(),
            search_retry: RetryPolicy::new(&config.retry, metrics),
            search_batch_size: config.batch.search_batch_size.max(1),
            search_batch_pause: config.batch.search_batch_pause(),
            throttle: LogThrottle::new(Duration::from_secs(config.worker.log_throttle_secs)),
        }
    }

    pub fn doc_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.doc_breaker
    }

    pub fn search_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.search_breaker
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.documents
    }

    pub fn search(&self) -> &Arc<dyn SearchIndex> {
        &self.search
    }

    /// Write one batch to both stores
    ///
    /// The batch is consumed and dropped as soon as both writes are done.
    pub async fn write(&self, records: Vec<PartRecord>) -> BatchReport {
        if records.is_empty() {
            return BatchReport::default();
        }

        let (documents, search) = tokio::join!(self.write_documents(&records), self.write_search(&records));
        drop(records);

        let mut report = BatchReport {
            indexed: search.indexed,
            index_failed: search.failed,
            ..BatchReport::default()
        };
        match documents {
            Ok(counts) => {
                report.inserted = counts.inserted;
                report.updated = counts.updated;
            },
            Err(e) => report.doc_error = Some(e),
        }
        report
    }

    async fn write_documents(&self, records: &[PartRecord]) -> Result<UpsertCounts, SyncError> {
        let result = self
            .doc_retry
            .run("document upsert", || {
                self.doc_breaker.call(|| self.documents.bulk_upsert(records))
            })
            .await;

        if let Err(e) = &result {
            if let Some(suppressed) = self.throttle.should_emit("document-upsert-failed") {
                warn!(
                    store = self.documents.name(),
                    records = records.len(),
                    suppressed,
                    error = %e,
                    "Document store write failed"
                );
            }
        }
        result
    }

    async fn write_search(&self, records: &[PartRecord]) -> BulkIndexReport {
        let mut report = BulkIndexReport::default();
        let chunks = records.chunks(self.search_batch_size);
        let total = chunks.len();

        for (i, chunk) in chunks.enumerate() {
            let result = self
                .search_retry
                .run("search bulk index", || {
                    self.search_breaker.call(|| self.search.bulk_index(chunk))
                })
                .await;

            match result {
                Ok(chunk_report) => report += chunk_report,
                Err(e) => {
                    report.failed += chunk.len() as u64;
                    if let Some(suppressed) = self.throttle.should_emit("search-index-failed") {
                        warn!(
                            index = self.search.name(),
                            documents = chunk.len(),
                            suppressed,
                            error = %e,
                            "Search index write failed, documents left for the next sync"
                        );
                    }
                },
            }

            if i + 1 < total && !self.search_batch_pause.is_zero() {
                tokio::time::sleep(self.search_batch_pause).await;
            }
        }

        debug!(indexed = report.indexed, failed = report.failed, chunks = total, "Indexed batch");
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::test_support::part;
    use crate::store::{Fault, MemoryDocumentStore, MemorySearchIndex};

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.batch.search_batch_size = 2;
        config.batch.search_batch_pause_ms = 0;
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 2;
        config.retry.max_retries = 2;
        config
    }

    fn writer(docs: &Arc<MemoryDocumentStore>, search: &Arc<MemorySearchIndex>) -> BatchWriter {
        BatchWriter::new(docs.clone(), search.clone(), &config(), Arc::new(SyncMetrics::new()))
    }

    #[tokio::test]
    async fn test_search_writes_are_sub_batched() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let search = Arc::new(MemorySearchIndex::new());
        let writer = writer(&docs, &search);

        let report = writer.write(vec![part("A", 1), part("B", 2), part("C", 3)]).await;
        assert_eq!(report.inserted, 3);
        assert_eq!(report.indexed, 3);
        assert_eq!(search.calls(), 2);
        assert_eq!(docs.calls(), 1);
    }

    #[tokio::test]
    async fn test_search_outage_is_counted_not_raised() {
        let docs = Arc::new(MemoryDocumentStore::new());
        let search = Arc::new(MemorySearchIndex::new());
        search.set_down(true);
        let writer = writer(&docs, &search);

        let report = writer.write(vec![part("A", 1), part("B", 2), part("C", 3)]).await;
        assert!(report.doc_error.is_none());
        assert_eq!(report.inserted, 3);
        assert_eq!(report.indexed, 0);
        assert_eq!(report.index_failed, 3);
    }

    #[tokio::test]
    async fn test_document_write_retries_transient_failure() {
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.inject(Fault::Unavailable, 1);
        let search = Arc::new(MemorySearchIndex::new());
        let writer = writer(&docs, &search);

        let report = writer.write(vec![part("A", 1)]).await;
        assert!(report.doc_error.is_none());
        assert_eq!(report.inserted, 1);
        assert_eq!(docs.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_document_write_is_reported() {
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.inject(Fault::Rejected, 1);
        let search = Arc::new(MemorySearchIndex::new());
        let writer = writer(&docs, &search);

        let report = writer.write(vec![part("A", 1)]).await;
        assert!(matches!(report.doc_error, Some(SyncError::Http { status: 400, .. })));
        assert_eq!(report.indexed, 1);
        assert_eq!(docs.calls(), 1);
    }
}
