//! In-memory stores for tests and dry runs
//!
//! Both stores can be told to fail: a queue of one-shot [`Fault`]s consumed
//! by the next calls, or a persistent outage.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{dedupe_last, BulkIndexReport, DocumentStore, SearchIndex, UpsertCounts};
use crate::error::{SyncError, SyncResult};
use crate::models::PartRecord;

/// Failure injected into the next store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Connection refused
    Unavailable,
    /// HTTP 429
    RateLimited,
    /// HTTP 400, not retryable
    Rejected,
}

impl Fault {
    fn into_error(self, target: &str) -> SyncError {
        match self {
            Fault::Unavailable => SyncError::connection(target, "connection refused"),
            Fault::RateLimited => SyncError::RateLimited {
                target: target.to_string(),
                retry_after: None,
            },
            Fault::Rejected => SyncError::Http {
                target: target.to_string(),
                status: 400,
                message: "rejected".to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    queued: Mutex<VecDeque<Fault>>,
    down: AtomicBool,
    calls: AtomicU64,
}

impl Faults {
    fn check(&self, target: &str) -> SyncResult<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.down.load(Ordering::Relaxed) {
            return Err(Fault::Unavailable.into_error(target));
        }
        let next = self.queued.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        match next {
            Some(fault) => Err(fault.into_error(target)),
            None => Ok(()),
        }
    }

    fn inject(&self, fault: Fault, times: usize) {
        let mut queued = self.queued.lock().unwrap_or_else(|p| p.into_inner());
        queued.extend(std::iter::repeat(fault).take(times));
    }
}

type PartKey = (String, Uuid, String);

fn owned_key(record: &PartRecord) -> PartKey {
    (record.part_number.clone(), record.integration_id, record.file_name.clone())
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    parts: Mutex<HashMap<PartKey, PartRecord>>,
    faults: Faults,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls with `fault`
    pub fn inject(&self, fault: Fault, times: usize) {
        self.faults.inject(fault, times);
    }

    /// Fail every call until set back to `false`
    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::Relaxed);
    }

    /// Calls attempted, failed ones included
    pub fn calls(&self) -> u64 {
        self.faults.calls.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.parts.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, part_number: &str, integration_id: Uuid, file_name: &str) -> Option<PartRecord> {
        self.parts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&(part_number.to_string(), integration_id, file_name.to_string()))
            .cloned()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn name(&self) -> &'static str {
        "memory-documents"
    }

    async fn bulk_upsert(&self, records: &[PartRecord]) -> SyncResult<UpsertCounts> {
        self.faults.check(self.name())?;

        let mut parts = self.parts.lock().unwrap_or_else(|p| p.into_inner());
        let mut counts = UpsertCounts::default();
        for record in dedupe_last(records) {
            match parts.get_mut(&owned_key(record)) {
                Some(existing) => {
                    let imported_at = existing.imported_at;
                    *existing = record.clone();
                    existing.imported_at = imported_at;
                    counts.updated += 1;
                },
                None => {
                    parts.insert(owned_key(record), record.clone());
                    counts.inserted += 1;
                },
            }
        }
        Ok(counts)
    }

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64> {
        self.faults.check(self.name())?;

        let mut parts = self.parts.lock().unwrap_or_else(|p| p.into_inner());
        let before = parts.len();
        parts.retain(|(_, id, _), _| *id != integration_id);
        Ok((before - parts.len()) as u64)
    }
}

#[derive(Debug, Default)]
pub struct MemorySearchIndex {
    documents: Mutex<HashMap<String, PartRecord>>,
    visible: AtomicU64,
    faults: Faults,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, fault: Fault, times: usize) {
        self.faults.inject(fault, times);
    }

    pub fn set_down(&self, down: bool) {
        self.faults.down.store(down, Ordering::Relaxed);
    }

    pub fn calls(&self) -> u64 {
        self.faults.calls.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.documents.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Documents visible as of the last refresh
    pub fn visible(&self) -> u64 {
        self.visible.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    fn name(&self) -> &'static str {
        "memory-search"
    }

    async fn bulk_index(&self, records: &[PartRecord]) -> SyncResult<BulkIndexReport> {
        self.faults.check(self.name())?;

        let mut documents = self.documents.lock().unwrap_or_else(|p| p.into_inner());
        for record in records {
            documents.insert(record.search_id(), record.clone());
        }
        Ok(BulkIndexReport {
            indexed: records.len() as u64,
            failed: 0,
        })
    }

    async fn refresh(&self) -> SyncResult<()> {
        self.faults.check(self.name())?;
        self.visible.store(self.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    async fn count(&self, integration_id: Option<Uuid>) -> SyncResult<u64> {
        self.faults.check(self.name())?;
        let documents = self.documents.lock().unwrap_or_else(|p| p.into_inner());
        let count = match integration_id {
            Some(id) => documents.values().filter(|d| d.integration_id == id).count(),
            None => documents.len(),
        };
        Ok(count as u64)
    }

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64> {
        self.faults.check(self.name())?;
        let mut documents = self.documents.lock().unwrap_or_else(|p| p.into_inner());
        let before = documents.len();
        documents.retain(|_, d| d.integration_id != integration_id);
        Ok((before - documents.len()) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::test_support::part;

    #[tokio::test]
    async fn test_upsert_splits_inserted_and_updated() {
        let store = MemoryDocumentStore::new();
        let first = store.bulk_upsert(&[part("A", 1), part("B", 2)]).await.unwrap();
        assert_eq!(first, UpsertCounts { inserted: 2, updated: 0 });

        let second = store.bulk_upsert(&[part("A", 7), part("C", 3)]).await.unwrap();
        assert_eq!(second, UpsertCounts { inserted: 1, updated: 1 });
        assert_eq!(store.get("A", Uuid::nil(), "stock.csv").unwrap().quantity, 7);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let index = MemorySearchIndex::new();
        index.inject(Fault::RateLimited, 1);
        index.inject(Fault::Unavailable, 1);

        assert!(index.bulk_index(&[part("A", 1)]).await.unwrap_err().is_rate_limited());
        assert!(index.bulk_index(&[part("A", 1)]).await.unwrap_err().is_transient());
        assert_eq!(index.bulk_index(&[part("A", 1)]).await.unwrap().indexed, 1);
        assert_eq!(index.calls(), 3);
    }
}
