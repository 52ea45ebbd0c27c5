//! Sync state: integrations, the request queue, live progress and history

pub mod memory;
pub mod postgres;

pub use memory::MemorySyncStore;
pub use postgres::PgSyncStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::models::{Integration, RequestStatus, RunHistory, SyncProgress, SyncRequest};

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn get_integration(&self, id: Uuid) -> SyncResult<Option<Integration>>;

    /// Insert or replace
    async fn save_integration(&self, integration: &Integration) -> SyncResult<()>;

    async fn enqueue_request(&self, integration_id: Uuid) -> SyncResult<SyncRequest>;

    /// Oldest pending request, atomically moved to `processing`
    async fn claim_next_request(&self) -> SyncResult<Option<SyncRequest>>;

    async fn finish_request(&self, id: Uuid, status: RequestStatus, error: Option<String>) -> SyncResult<()>;

    async fn put_progress(&self, progress: &SyncProgress) -> SyncResult<()>;

    async fn get_progress(&self, run_id: Uuid) -> SyncResult<Option<SyncProgress>>;

    /// Drop finished progress snapshots last updated before `older_than`
    async fn purge_progress(&self, older_than: DateTime<Utc>) -> SyncResult<u64>;

    async fn append_history(&self, history: &RunHistory) -> SyncResult<()>;

    async fn get_history(&self, run_id: Uuid) -> SyncResult<Option<RunHistory>>;

    /// Most recent first
    async fn list_history(&self, integration_id: Uuid, limit: u32) -> SyncResult<Vec<RunHistory>>;
}
