//! Destination stores
//!
//! Parts are written to two independent stores: the canonical document
//! store (PostgreSQL) and the search index (Elasticsearch). Neither knows
//! about the other; the [`crate::writer::BatchWriter`] drives both.

pub mod elastic;
pub mod memory;
pub mod postgres;

pub use elastic::ElasticsearchIndex;
pub use memory::{Fault, MemoryDocumentStore, MemorySearchIndex};
pub use postgres::PgDocumentStore;

use async_trait::async_trait;
use std::collections::HashSet;
use std::ops::AddAssign;
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::PartRecord;

/// Inserted/updated split of one bulk upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
    }
}

/// Outcome of one bulk index call; per-document failures are not errors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkIndexReport {
    pub indexed: u64,
    pub failed: u64,
}

impl AddAssign for BulkIndexReport {
    fn add_assign(&mut self, other: Self) {
        self.indexed += other.indexed;
        self.failed += other.failed;
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Insert or overwrite by `(part number, integration, file)`
    ///
    /// Duplicate keys inside `records` collapse to the last occurrence.
    async fn bulk_upsert(&self, records: &[PartRecord]) -> SyncResult<UpsertCounts>;

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    fn name(&self) -> &'static str;

    /// Index documents under their [`PartRecord::search_id`]
    async fn bulk_index(&self, records: &[PartRecord]) -> SyncResult<BulkIndexReport>;

    /// Make everything indexed so far visible to searches
    async fn refresh(&self) -> SyncResult<()>;

    /// Document count, optionally for one integration
    async fn count(&self, integration_id: Option<Uuid>) -> SyncResult<u64>;

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64>;

    /// Drop anything cached in memory
    fn release_caches(&self) {}
}

/// Keep only the last occurrence of each record key, in first-seen order of
/// the survivors
pub fn dedupe_last(records: &[PartRecord]) -> Vec<&PartRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut kept: Vec<&PartRecord> = records.iter().rev().filter(|r| seen.insert(r.key())).collect();
    kept.reverse();
    kept
}
