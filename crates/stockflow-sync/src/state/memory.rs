//! In-memory sync state for tests and local runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::SyncStore;
use crate::error::SyncResult;
use crate::models::{Integration, RequestStatus, RunHistory, SyncProgress, SyncRequest};

#[derive(Debug, Default)]
struct Inner {
    integrations: HashMap<Uuid, Integration>,
    requests: Vec<SyncRequest>,
    progress: HashMap<Uuid, SyncProgress>,
    history: Vec<RunHistory>,
}

#[derive(Debug, Default)]
pub struct MemorySyncStore {
    inner: Mutex<Inner>,
}

impl MemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn request(&self, id: Uuid) -> Option<SyncRequest> {
        self.lock().requests.iter().find(|r| r.id == id).cloned()
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn get_integration(&self, id: Uuid) -> SyncResult<Option<Integration>> {
        Ok(self.lock().integrations.get(&id).cloned())
    }

    async fn save_integration(&self, integration: &Integration) -> SyncResult<()> {
        self.lock().integrations.insert(integration.id, integration.clone());
        Ok(())
    }

    async fn enqueue_request(&self, integration_id: Uuid) -> SyncResult<SyncRequest> {
        let request = SyncRequest::new(integration_id);
        self.lock().requests.push(request.clone());
        Ok(request)
    }

    async fn claim_next_request(&self) -> SyncResult<Option<SyncRequest>> {
        let mut inner = self.lock();
        let next = inner
            .requests
            .iter_mut()
            .filter(|r| r.status == RequestStatus::Pending)
            .min_by_key(|r| r.requested_at);

        Ok(next.map(|request| {
            request.status = RequestStatus::Processing;
            request.started_at = Some(Utc::now());
            request.clone()
        }))
    }

    async fn finish_request(&self, id: Uuid, status: RequestStatus, error: Option<String>) -> SyncResult<()> {
        if let Some(request) = self.lock().requests.iter_mut().find(|r| r.id == id) {
            request.status = status;
            request.finished_at = Some(Utc::now());
            request.error = error;
        }
        Ok(())
    }

    async fn put_progress(&self, progress: &SyncProgress) -> SyncResult<()> {
        self.lock().progress.insert(progress.run_id, progress.clone());
        Ok(())
    }

    async fn get_progress(&self, run_id: Uuid) -> SyncResult<Option<SyncProgress>> {
        Ok(self.lock().progress.get(&run_id).cloned())
    }

    async fn purge_progress(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let mut inner = self.lock();
        let before = inner.progress.len();
        inner
            .progress
            .retain(|_, p| !(p.status.is_terminal() && p.updated_at < older_than));
        Ok((before - inner.progress.len()) as u64)
    }

    async fn append_history(&self, history: &RunHistory) -> SyncResult<()> {
        let mut inner = self.lock();
        if !inner.history.iter().any(|h| h.run_id == history.run_id) {
            inner.history.push(history.clone());
        }
        Ok(())
    }

    async fn get_history(&self, run_id: Uuid) -> SyncResult<Option<RunHistory>> {
        Ok(self.lock().history.iter().find(|h| h.run_id == run_id).cloned())
    }

    async fn list_history(&self, integration_id: Uuid, limit: u32) -> SyncResult<Vec<RunHistory>> {
        let mut runs: Vec<RunHistory> = self
            .lock()
            .history
            .iter()
            .filter(|h| h.integration_id == integration_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.finished_at.cmp(&a.finished_at));
        runs.truncate(limit as usize);
        Ok(runs)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_claims_oldest_pending_once() {
        let store = MemorySyncStore::new();
        let integration = Uuid::new_v4();
        let first = store.enqueue_request(integration).await.unwrap();
        let second = store.enqueue_request(integration).await.unwrap();

        let claimed = store.claim_next_request().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, RequestStatus::Processing);

        let claimed = store.claim_next_request().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_keeps_live_snapshots() {
        let store = MemorySyncStore::new();
        let stale = Utc::now() - Duration::hours(2);

        let mut finished = SyncProgress::new(Uuid::new_v4(), Uuid::new_v4());
        finished.status = RequestStatus::Completed;
        finished.updated_at = stale;
        store.put_progress(&finished).await.unwrap();

        let mut running = SyncProgress::new(Uuid::new_v4(), Uuid::new_v4());
        running.updated_at = stale;
        store.put_progress(&running).await.unwrap();

        let purged = store.purge_progress(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_progress(finished.run_id).await.unwrap().is_none());
        assert!(store.get_progress(running.run_id).await.unwrap().is_some());
    }
}
