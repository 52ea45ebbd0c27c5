//! PostgreSQL-backed sync state
//!
//! Integrations, progress snapshots and history records are stored as JSONB
//! documents next to the columns the queries filter on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use super::SyncStore;
use crate::error::{SyncError, SyncResult};
use crate::models::{Integration, RequestStatus, RunHistory, SyncProgress, SyncRequest};

const REQUEST_COLUMNS: &str = "id, integration_id, status, requested_at, started_at, finished_at, error";

#[derive(Debug, Clone)]
pub struct PgSyncStore {
    pool: PgPool,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn request_from_row(row: &PgRow) -> SyncResult<SyncRequest> {
        let status: String = row.try_get("status")?;
        Ok(SyncRequest {
            id: row.try_get("id")?,
            integration_id: row.try_get("integration_id")?,
            status: RequestStatus::parse(&status)
                .ok_or_else(|| SyncError::Config(format!("unknown request status '{}'", status)))?,
            requested_at: row.try_get("requested_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            error: row.try_get("error")?,
        })
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn get_integration(&self, id: Uuid) -> SyncResult<Option<Integration>> {
        let row = sqlx::query("SELECT config FROM integrations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let config: serde_json::Value = row.try_get("config")?;
                Ok(Some(serde_json::from_value(config)?))
            },
            None => Ok(None),
        }
    }

    async fn save_integration(&self, integration: &Integration) -> SyncResult<()> {
        let config = serde_json::to_value(integration)?;
        sqlx::query(
            r#"
            INSERT INTO integrations (id, name, enabled, status, config)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                enabled = EXCLUDED.enabled,
                status = EXCLUDED.status,
                config = EXCLUDED.config,
                updated_at = NOW()
            "#,
        )
        .bind(integration.id)
        .bind(&integration.name)
        .bind(integration.enabled)
        .bind(integration.status.as_str())
        .bind(config)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enqueue_request(&self, integration_id: Uuid) -> SyncResult<SyncRequest> {
        let request = SyncRequest::new(integration_id);
        sqlx::query("INSERT INTO sync_requests (id, integration_id, status, requested_at) VALUES ($1, $2, $3, $4)")
            .bind(request.id)
            .bind(request.integration_id)
            .bind(request.status.as_str())
            .bind(request.requested_at)
            .execute(&self.pool)
            .await?;
        debug!(request_id = %request.id, integration_id = %integration_id, "Enqueued sync request");
        Ok(request)
    }

    async fn claim_next_request(&self) -> SyncResult<Option<SyncRequest>> {
        let sql = format!(
            r#"
            UPDATE sync_requests
            SET status = 'processing', started_at = NOW()
            WHERE id = (
                SELECT id FROM sync_requests
                WHERE status = 'pending'
                ORDER BY requested_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {}
            "#,
            REQUEST_COLUMNS
        );

        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::request_from_row).transpose()
    }

    async fn finish_request(&self, id: Uuid, status: RequestStatus, error: Option<String>) -> SyncResult<()> {
        sqlx::query("UPDATE sync_requests SET status = $2, finished_at = NOW(), error = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn put_progress(&self, progress: &SyncProgress) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_progress (run_id, integration_id, document, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (run_id) DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(progress.run_id)
        .bind(progress.integration_id)
        .bind(serde_json::to_value(progress)?)
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_progress(&self, run_id: Uuid) -> SyncResult<Option<SyncProgress>> {
        let row = sqlx::query("SELECT document FROM sync_progress WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.try_get("document")?)?)),
            None => Ok(None),
        }
    }

    async fn purge_progress(&self, older_than: DateTime<Utc>) -> SyncResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM sync_progress
            WHERE updated_at < $1
              AND document->>'status' IN ('completed', 'failed')
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn append_history(&self, history: &RunHistory) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_history (run_id, integration_id, status, document, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (run_id) DO NOTHING
            "#,
        )
        .bind(history.run_id)
        .bind(history.integration_id)
        .bind(history.status.as_str())
        .bind(serde_json::to_value(history)?)
        .bind(history.started_at)
        .bind(history.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_history(&self, run_id: Uuid) -> SyncResult<Option<RunHistory>> {
        let row = sqlx::query("SELECT document FROM sync_history WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_value(row.try_get("document")?)?)),
            None => Ok(None),
        }
    }

    async fn list_history(&self, integration_id: Uuid, limit: u32) -> SyncResult<Vec<RunHistory>> {
        let rows = sqlx::query(
            "SELECT document FROM sync_history WHERE integration_id = $1 ORDER BY finished_at DESC LIMIT $2",
        )
        .bind(integration_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(serde_json::from_value(row.try_get("document")?)?))
            .collect()
    }
}
