//! Source connectors
//!
//! A connector lists the raw files an integration exposes and hands out a
//! byte stream per file (or JSON pages for API sources). Every call opens its
//! own connection and closes it before returning. Retrying is the caller's
//! business.

pub mod ftp;
pub mod http;
pub mod local;

pub use ftp::FtpConnector;
pub use http::HttpConnector;
pub use local::LocalConnector;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde_json::Value;
use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

use crate::error::{SyncError, SyncResult};
use crate::models::SourceConfig;

/// A file available from a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    /// Size in bytes, 0 when the source does not say
    pub size: u64,
}

/// One page of an API source
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Value>,
    pub next_cursor: Option<String>,
}

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Record-oriented sources are read through [`SourceConnector::fetch_page`]
    fn is_paginated(&self) -> bool {
        false
    }

    /// Files to ingest, largest first
    async fn list(&self) -> SyncResult<Vec<FileDescriptor>>;

    async fn download(&self, file: &FileDescriptor) -> SyncResult<ByteStream>;

    async fn fetch_page(&self, _cursor: Option<&str>) -> SyncResult<Page> {
        Err(SyncError::Config(format!(
            "{} sources are not paginated",
            self.kind()
        )))
    }
}

/// Settings shared by every connector of one run
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    /// Run-scoped spool directory
    pub cache_dir: PathBuf,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

pub fn build_connector(source: &SourceConfig, settings: &ConnectorSettings) -> SyncResult<Arc<dyn SourceConnector>> {
    let connector: Arc<dyn SourceConnector> = match source {
        SourceConfig::Ftp {
            host,
            port,
            username,
            password,
            path,
            pattern,
        } => Arc::new(FtpConnector::new(
            ftp::FtpConfig {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.clone(),
                path: path.clone(),
                pattern: pattern.clone(),
                connect_timeout: settings.connect_timeout,
                request_timeout: settings.request_timeout,
            },
            settings.cache_dir.clone(),
        )),
        SourceConfig::Http {
            base_url,
            token,
            records_pointer,
            cursor_pointer,
            page_size,
            min_interval_ms,
        } => Arc::new(HttpConnector::new(
            http::HttpSourceConfig {
                base_url: base_url.clone(),
                token: token.clone(),
                records_pointer: records_pointer.clone(),
                cursor_pointer: cursor_pointer.clone(),
                page_size: *page_size,
                min_interval: Duration::from_millis(*min_interval_ms),
            },
            settings.connect_timeout,
            settings.request_timeout,
        )?),
        SourceConfig::Local { path, pattern } => Arc::new(LocalConnector::new(
            path.clone(),
            pattern.clone(),
            settings.cache_dir.clone(),
        )),
    };
    Ok(connector)
}

/// Case-insensitive suffix match; `*.csv` and `.csv` are equivalent
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let suffix = pattern.trim_start_matches('*').to_lowercase();
    suffix.is_empty() || name.to_lowercase().ends_with(&suffix)
}

pub fn is_gzip(name: &str) -> bool {
    name.to_lowercase().ends_with(".gz")
}

/// Largest first, so the long files start early and the small ones fill in
pub fn order_largest_first(files: &mut [FileDescriptor]) {
    files.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name)));
}

/// Copy `reader` into `dest`, gunzipping on the way when asked
///
/// Blocking; call from `spawn_blocking`.
pub fn spool_to_file(reader: &mut dyn Read, dest: &Path, gunzip: bool) -> io::Result<u64> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(dest)?);
    let written = if gunzip {
        io::copy(&mut GzDecoder::new(reader), &mut out)?
    } else {
        io::copy(reader, &mut out)?
    };
    out.flush()?;
    Ok(written)
}

/// Spool path for a source file, with any `.gz` suffix dropped
pub fn spool_path(cache_dir: &Path, name: &str) -> PathBuf {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.replace('/', "_"));
    let base = if is_gzip(&base) {
        base[..base.len() - 3].to_string()
    } else {
        base
    };
    cache_dir.join(base)
}
