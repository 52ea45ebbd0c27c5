//! PostgreSQL pool and schema migrations

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::SyncResult;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

pub async fn create_pool(url: &str, config: &DatabaseConfig) -> SyncResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .idle_timeout(IDLE_TIMEOUT)
        .connect(url)
        .await?;

    info!(max_connections = config.max_connections, "Database connection pool created");
    Ok(pool)
}

/// Apply the embedded migrations from `migrations/`
pub async fn run_migrations(pool: &PgPool) -> SyncResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("Database migrations applied");
    Ok(())
}

/// Round-trip a trivial query to prove the pool can reach the server
pub async fn health_check(pool: &PgPool) -> SyncResult<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
