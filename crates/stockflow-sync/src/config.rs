//! Sync pipeline configuration
//!
//! Every tunable is read from `STOCKFLOW_*` environment variables (a `.env`
//! file is loaded by the binary) and checked by [`SyncConfig::validate`].

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Records per document-store batch
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Upper bound keeping one multi-row upsert under Postgres' 65535 bind limit
pub const MAX_BATCH_SIZE: usize = 2500;

/// Documents per search-index `_bulk` call
pub const DEFAULT_SEARCH_BATCH_SIZE: usize = 500;
pub const DEFAULT_SEARCH_BATCH_PAUSE_MS: u64 = 100;

pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;

pub const DEFAULT_BREAKER_THRESHOLD: u32 = 5;
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 30;
pub const DEFAULT_BREAKER_MAX_COOLDOWN_SECS: u64 = 300;

pub const DEFAULT_MEMORY_CEILING_MB: u64 = 1024;
pub const DEFAULT_MEMORY_CHECK_INTERVAL_MS: u64 = 1000;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 3;
pub const DEFAULT_PROGRESS_RETENTION_SECS: u64 = 3600;
pub const DEFAULT_LOW_STOCK_THRESHOLD: i64 = 10;
pub const DEFAULT_CURRENCY: &str = "AED";
pub const DEFAULT_LOG_THROTTLE_SECS: u64 = 60;

pub const DEFAULT_ELASTICSEARCH_URL: &str = "http://localhost:9200";
pub const DEFAULT_ELASTICSEARCH_INDEX: &str = "parts";
pub const DEFAULT_COUNT_CACHE_TTL_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{}={:?} is invalid: {}", key, raw, e)),
        _ => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Batch sizing for the two stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub search_batch_size: usize,
    pub search_batch_pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            search_batch_size: DEFAULT_SEARCH_BATCH_SIZE,
            search_batch_pause_ms: DEFAULT_SEARCH_BATCH_PAUSE_MS,
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            batch_size: env_parse("STOCKFLOW_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            search_batch_size: env_parse("STOCKFLOW_SEARCH_BATCH_SIZE", DEFAULT_SEARCH_BATCH_SIZE)?,
            search_batch_pause_ms: env_parse(
                "STOCKFLOW_SEARCH_BATCH_PAUSE_MS",
                DEFAULT_SEARCH_BATCH_PAUSE_MS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!("STOCKFLOW_BATCH_SIZE must be between 1 and {}", MAX_BATCH_SIZE);
        }
        if self.search_batch_size == 0 {
            anyhow::bail!("STOCKFLOW_SEARCH_BATCH_SIZE must be greater than 0");
        }
        Ok(())
    }

    pub fn search_batch_pause(&self) -> Duration {
        Duration::from_millis(self.search_batch_pause_ms)
    }
}

/// Backoff bounds shared by every retried call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            base_delay_ms: env_parse("STOCKFLOW_RETRY_BASE_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS)?,
            max_delay_ms: env_parse("STOCKFLOW_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS)?,
            max_retries: env_parse("STOCKFLOW_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_delay_ms > self.max_delay_ms {
            anyhow::bail!("STOCKFLOW_RETRY_BASE_DELAY_MS must not exceed STOCKFLOW_RETRY_MAX_DELAY_MS");
        }
        Ok(())
    }
}

/// Circuit breaker thresholds, one breaker per dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub max_cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_BREAKER_THRESHOLD,
            cooldown_secs: DEFAULT_BREAKER_COOLDOWN_SECS,
            max_cooldown_secs: DEFAULT_BREAKER_MAX_COOLDOWN_SECS,
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            failure_threshold: env_parse("STOCKFLOW_BREAKER_THRESHOLD", DEFAULT_BREAKER_THRESHOLD)?,
            cooldown_secs: env_parse("STOCKFLOW_BREAKER_COOLDOWN_SECS", DEFAULT_BREAKER_COOLDOWN_SECS)?,
            max_cooldown_secs: env_parse(
                "STOCKFLOW_BREAKER_MAX_COOLDOWN_SECS",
                DEFAULT_BREAKER_MAX_COOLDOWN_SECS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.failure_threshold == 0 {
            anyhow::bail!("STOCKFLOW_BREAKER_THRESHOLD must be greater than 0");
        }
        if self.cooldown_secs > self.max_cooldown_secs {
            anyhow::bail!("STOCKFLOW_BREAKER_COOLDOWN_SECS must not exceed STOCKFLOW_BREAKER_MAX_COOLDOWN_SECS");
        }
        Ok(())
    }
}

/// Resident-memory ceiling enforced by the watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub ceiling_mb: u64,
    pub check_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            ceiling_mb: DEFAULT_MEMORY_CEILING_MB,
            check_interval_ms: DEFAULT_MEMORY_CHECK_INTERVAL_MS,
        }
    }
}

impl MemoryConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            ceiling_mb: env_parse("STOCKFLOW_MEMORY_CEILING_MB", DEFAULT_MEMORY_CEILING_MB)?,
            check_interval_ms: env_parse(
                "STOCKFLOW_MEMORY_CHECK_INTERVAL_MS",
                DEFAULT_MEMORY_CHECK_INTERVAL_MS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ceiling_mb == 0 {
            anyhow::bail!("STOCKFLOW_MEMORY_CEILING_MB must be greater than 0");
        }
        if self.check_interval_ms == 0 {
            anyhow::bail!("STOCKFLOW_MEMORY_CHECK_INTERVAL_MS must be greater than 0");
        }
        Ok(())
    }

    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_mb.saturating_mul(1024 * 1024)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Worker loop and per-run behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub poll_interval_secs: u64,
    pub download_concurrency: usize,
    pub progress_retention_secs: u64,
    /// Spool directory for downloaded source files
    pub cache_dir: PathBuf,
    pub low_stock_threshold: i64,
    pub default_currency: String,
    pub log_throttle_secs: u64,
    /// Per-call timeouts towards sources
    pub source_connect_timeout_secs: u64,
    pub source_request_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY,
            progress_retention_secs: DEFAULT_PROGRESS_RETENTION_SECS,
            cache_dir: std::env::temp_dir().join("stockflow-cache"),
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            default_currency: DEFAULT_CURRENCY.to_string(),
            log_throttle_secs: DEFAULT_LOG_THROTTLE_SECS,
            source_connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            source_request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            poll_interval_secs: env_parse("STOCKFLOW_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            download_concurrency: env_parse(
                "STOCKFLOW_DOWNLOAD_CONCURRENCY",
                DEFAULT_DOWNLOAD_CONCURRENCY,
            )?,
            progress_retention_secs: env_parse(
                "STOCKFLOW_PROGRESS_RETENTION_SECS",
                DEFAULT_PROGRESS_RETENTION_SECS,
            )?,
            cache_dir: std::env::var("STOCKFLOW_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            low_stock_threshold: env_parse(
                "STOCKFLOW_LOW_STOCK_THRESHOLD",
                DEFAULT_LOW_STOCK_THRESHOLD,
            )?,
            default_currency: env_string("STOCKFLOW_DEFAULT_CURRENCY", DEFAULT_CURRENCY),
            log_throttle_secs: env_parse("STOCKFLOW_LOG_THROTTLE_SECS", DEFAULT_LOG_THROTTLE_SECS)?,
            source_connect_timeout_secs: env_parse(
                "STOCKFLOW_SOURCE_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?,
            source_request_timeout_secs: env_parse(
                "STOCKFLOW_SOURCE_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("STOCKFLOW_POLL_INTERVAL_SECS must be greater than 0");
        }
        if self.download_concurrency == 0 {
            anyhow::bail!("STOCKFLOW_DOWNLOAD_CONCURRENCY must be greater than 0");
        }
        if self.low_stock_threshold < 0 {
            anyhow::bail!("STOCKFLOW_LOW_STOCK_THRESHOLD must not be negative");
        }
        if self.default_currency.len() != 3 {
            anyhow::bail!("STOCKFLOW_DEFAULT_CURRENCY must be a three-letter code");
        }
        if self.source_connect_timeout_secs == 0 || self.source_request_timeout_secs == 0 {
            anyhow::bail!("source timeouts must be greater than 0");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn progress_retention(&self) -> Duration {
        Duration::from_secs(self.progress_retention_secs)
    }

    pub fn source_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.source_connect_timeout_secs)
    }

    pub fn source_request_timeout(&self) -> Duration {
        Duration::from_secs(self.source_request_timeout_secs)
    }
}

/// Elasticsearch connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub url: String,
    pub index: String,
    pub count_cache_ttl_secs: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ELASTICSEARCH_URL.to_string(),
            index: DEFAULT_ELASTICSEARCH_INDEX.to_string(),
            count_cache_ttl_secs: DEFAULT_COUNT_CACHE_TTL_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl SearchConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            url: env_string("STOCKFLOW_ELASTICSEARCH_URL", DEFAULT_ELASTICSEARCH_URL),
            index: env_string("STOCKFLOW_ELASTICSEARCH_INDEX", DEFAULT_ELASTICSEARCH_INDEX),
            count_cache_ttl_secs: env_parse(
                "STOCKFLOW_COUNT_CACHE_TTL_SECS",
                DEFAULT_COUNT_CACHE_TTL_SECS,
            )?,
            connect_timeout_secs: env_parse(
                "STOCKFLOW_CONNECT_TIMEOUT_SECS",
                DEFAULT_CONNECT_TIMEOUT_SECS,
            )?,
            request_timeout_secs: env_parse(
                "STOCKFLOW_REQUEST_TIMEOUT_SECS",
                DEFAULT_REQUEST_TIMEOUT_SECS,
            )?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            anyhow::bail!("STOCKFLOW_ELASTICSEARCH_URL must be an http(s) URL");
        }
        if self.index.is_empty() || self.index.chars().any(|c| c.is_ascii_uppercase()) {
            anyhow::bail!("STOCKFLOW_ELASTICSEARCH_INDEX must be a non-empty lowercase name");
        }
        Ok(())
    }

    pub fn count_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.count_cache_ttl_secs)
    }
}

/// Postgres connection for the part store and run state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
        }
    }
}

impl DatabaseConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let url = std::env::var("STOCKFLOW_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok();
        Ok(Self {
            url,
            max_connections: env_parse("STOCKFLOW_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?,
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_connections == 0 {
            anyhow::bail!("STOCKFLOW_DB_MAX_CONNECTIONS must be greater than 0");
        }
        Ok(())
    }

    /// The connection string, required by every command touching Postgres
    pub fn require_url(&self) -> anyhow::Result<&str> {
        self.url
            .as_deref()
            .context("STOCKFLOW_DATABASE_URL (or DATABASE_URL) must be set")
    }
}

/// Main sync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub memory: MemoryConfig,
    pub worker: WorkerConfig,
    pub search: SearchConfig,
    pub database: DatabaseConfig,
}

impl SyncConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self {
            batch: BatchConfig::from_env()?,
            retry: RetryConfig::from_env()?,
            breaker: BreakerConfig::from_env()?,
            memory: MemoryConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
            search: SearchConfig::from_env()?,
            database: DatabaseConfig::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.batch.validate()?;
        self.retry.validate()?;
        self.breaker.validate()?;
        self.memory.validate()?;
        self.worker.validate()?;
        self.search.validate()?;
        self.database.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.worker.default_currency, "AED");
    }

    #[test]
    fn test_batch_size_bounds() {
        let mut batch = BatchConfig::default();
        batch.batch_size = 0;
        assert!(batch.validate().is_err());
        batch.batch_size = MAX_BATCH_SIZE + 1;
        assert!(batch.validate().is_err());
        batch.batch_size = MAX_BATCH_SIZE;
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn test_breaker_cooldown_must_fit_cap() {
        let breaker = BreakerConfig {
            failure_threshold: 3,
            cooldown_secs: 600,
            max_cooldown_secs: 300,
        };
        assert!(breaker.validate().is_err());
    }

    #[test]
    fn test_search_index_name_validation() {
        let mut search = SearchConfig::default();
        assert!(search.validate().is_ok());
        search.index = "Parts".to_string();
        assert!(search.validate().is_err());
        search.index = "parts".to_string();
        search.url = "localhost:9200".to_string();
        assert!(search.validate().is_err());
    }

    #[test]
    fn test_memory_ceiling_bytes() {
        let memory = MemoryConfig {
            ceiling_mb: 2,
            check_interval_ms: 10,
        };
        assert_eq!(memory.ceiling_bytes(), 2 * 1024 * 1024);
        assert_eq!(memory.check_interval(), Duration::from_millis(10));

        let huge = MemoryConfig {
            ceiling_mb: u64::MAX / 1024,
            check_interval_ms: 10,
        };
        assert_eq!(huge.ceiling_bytes(), u64::MAX);
    }

    #[test]
    fn test_database_url_required_on_demand() {
        let database = DatabaseConfig::default();
        assert!(database.require_url().is_err());
        let database = DatabaseConfig {
            url: Some("postgres://localhost/stockflow".into()),
            ..Default::default()
        };
        assert_eq!(database.require_url().ok(), Some("postgres://localhost/stockflow"));
    }
}
