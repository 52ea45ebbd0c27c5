//! Error types for the sync pipeline
//!
//! Every failure crossing a component boundary is a [`SyncError`]. The
//! classification helpers decide what the resilience layer does with it:
//! retry with backoff, count it against a circuit breaker, record it against a
//! file, or abort the whole run.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for sync operations
pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rate limited by {target}")]
    RateLimited {
        target: String,
        retry_after: Option<Duration>,
    },

    #[error("HTTP {status} from {target}: {message}")]
    Http {
        target: String,
        status: u16,
        message: String,
    },

    #[error("Circuit breaker for {dependency} is open (retry in {retry_after:?})")]
    CircuitOpen {
        dependency: String,
        retry_after: Duration,
    },

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid source file {file}: {reason}")]
    InvalidFile { file: String, reason: String },

    #[error("Integration not found: {0}")]
    IntegrationNotFound(Uuid),

    #[error("Integration {0} is disabled")]
    IntegrationDisabled(Uuid),

    #[error("Integration {0} already has a sync in progress")]
    AlreadySyncing(Uuid),

    #[error("Sync cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    pub fn connection(target: impl Into<String>, message: impl ToString) -> Self {
        SyncError::Connection {
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_file(file: impl Into<String>, reason: impl Into<String>) -> Self {
        SyncError::InvalidFile {
            file: file.into(),
            reason: reason.into(),
        }
    }

    /// Connection-level failure worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Connection { .. } | SyncError::Timeout(_) => true,
            SyncError::Http { status, .. } => *status >= 500,
            SyncError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            SyncError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SyncError::RateLimited { .. })
    }

    /// Worth another attempt: transient failures and throttling
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || self.is_rate_limited()
    }

    /// Only unreachable/struggling dependencies trip a breaker. A 429 means
    /// the dependency is up and throttling.
    pub fn counts_against_breaker(&self) -> bool {
        self.is_transient()
    }

    /// Failures that abort the whole run rather than one file
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_)
                | SyncError::Config(_)
                | SyncError::RetriesExhausted { .. }
                | SyncError::IntegrationNotFound(_)
                | SyncError::IntegrationDisabled(_)
                | SyncError::Cancelled(_)
                | SyncError::Migration(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        let target = err
            .url()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "http".to_string());

        if err.is_timeout() {
            SyncError::Timeout(format!("{}: {}", target, err))
        } else if let Some(status) = err.status() {
            SyncError::Http {
                target,
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else if err.is_decode() {
            SyncError::Http {
                target,
                status: 200,
                message: format!("undecodable response body: {}", err),
            }
        } else {
            SyncError::Connection {
                target,
                message: err.to_string(),
            }
        }
    }
}

impl From<csv_async::Error> for SyncError {
    fn from(err: csv_async::Error) -> Self {
        SyncError::InvalidFile {
            file: "csv".to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::connection("ftp.example.com", "reset by peer").is_transient());
        assert!(SyncError::Timeout("read".into()).is_transient());
        assert!(SyncError::Http {
            target: "es".into(),
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!SyncError::Http {
            target: "es".into(),
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(SyncError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_transient());
        assert!(!SyncError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)).is_transient());
    }

    #[test]
    fn test_rate_limit_is_retryable_but_not_a_breaker_failure() {
        let err = SyncError::RateLimited {
            target: "es".into(),
            retry_after: None,
        };
        assert!(err.is_retryable());
        assert!(!err.counts_against_breaker());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::Auth("530 Login incorrect".into()).is_fatal());
        assert!(SyncError::RetriesExhausted {
            operation: "download".into(),
            attempts: 5,
            last_error: "reset".into()
        }
        .is_fatal());
        assert!(!SyncError::invalid_file("a.csv", "no part number column").is_fatal());
        assert!(!SyncError::connection("db", "refused").is_fatal());
    }
}
