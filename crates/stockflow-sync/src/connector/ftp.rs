//! FTP source connector
//!
//! Uses the blocking suppaftp client on the blocking thread pool. Every call
//! connects, logs in, does one thing and quits; there is no session reuse.
//! Downloads are spooled to the run's cache directory (gunzipping `.gz`
//! files on the way) and handed back as a file stream.
//!
//! All operations use Extended Passive Mode (EPSV) for NAT/firewall
//! compatibility. Control and data sockets both carry the read/write timeout,
//! so a server that stops answering fails the call instead of pinning a
//! blocking thread.

use async_trait::async_trait;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use suppaftp::{FtpError, FtpStream};
use tracing::{debug, info, warn};

use super::{
    is_gzip, matches_pattern, order_largest_first, spool_path, spool_to_file, ByteStream, FileDescriptor,
    SourceConnector,
};
use crate::error::{SyncError, SyncResult};
use crate::models::Secret;

/// Connection settings for one FTP integration
#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Secret,
    /// Remote directory holding the exports
    pub path: String,
    pub pattern: String,
    pub connect_timeout: Duration,
    /// Read/write timeout on the control and data sockets
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Connect,
    Login,
    Transfer,
}

#[derive(Debug)]
pub struct FtpConnector {
    config: FtpConfig,
    cache_dir: PathBuf,
}

impl FtpConnector {
    pub fn new(config: FtpConfig, cache_dir: PathBuf) -> Self {
        Self { config, cache_dir }
    }

    fn remote_path(&self, name: &str) -> String {
        let dir = self.config.path.trim_end_matches('/');
        if dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", dir, name)
        }
    }

    fn map_error(config: &FtpConfig, stage: Stage, err: FtpError) -> SyncError {
        match (stage, err) {
            (_, FtpError::ConnectionError(e))
                if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) =>
            {
                SyncError::Timeout(format!("FTP {} after {:?}: {}", config.host, config.request_timeout, e))
            },
            (_, FtpError::ConnectionError(e)) => SyncError::connection(&config.host, e),
            (Stage::Login, e) => SyncError::Auth(format!("FTP login to {} rejected: {}", config.host, e)),
            (Stage::Connect, e) => SyncError::connection(&config.host, e),
            // The server answered; a rejected RETR/LIST is not worth retrying
            (Stage::Transfer, e) => SyncError::invalid_file(format!("{}:{}", config.host, config.path), e.to_string()),
        }
    }

    /// Connect and log in (blocking)
    fn open_session(config: &FtpConfig) -> SyncResult<FtpStream> {
        debug!(host = %config.host, port = config.port, "Connecting to FTP server");

        let addr: SocketAddr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| SyncError::connection(&config.host, e))?
            .next()
            .ok_or_else(|| SyncError::Config(format!("FTP host {} did not resolve", config.host)))?;

        let socket = Self::open_socket(addr, config.connect_timeout, config.request_timeout)
            .map_err(|e| Self::map_error(config, Stage::Connect, FtpError::ConnectionError(e)))?;
        let (connect_timeout, request_timeout) = (config.connect_timeout, config.request_timeout);
        let mut ftp_stream = FtpStream::connect_with_stream(socket)
            .map_err(|e| Self::map_error(config, Stage::Connect, e))?
            .passive_stream_builder(move |data_addr| {
                Self::open_socket(data_addr, connect_timeout, request_timeout).map_err(FtpError::ConnectionError)
            });

        // Use Extended Passive Mode - better for NAT/Docker environments
        ftp_stream.set_mode(suppaftp::Mode::ExtendedPassive);

        debug!(username = %config.username, "Logging in");
        ftp_stream
            .login(config.username.as_str(), config.password.expose())
            .map_err(|e| Self::map_error(config, Stage::Login, e))?;

        Ok(ftp_stream)
    }

    fn open_socket(addr: SocketAddr, connect_timeout: Duration, io_timeout: Duration) -> std::io::Result<TcpStream> {
        let socket = TcpStream::connect_timeout(&addr, connect_timeout)?;
        socket.set_read_timeout(Some(io_timeout))?;
        socket.set_write_timeout(Some(io_timeout))?;
        Ok(socket)
    }

    fn close_session(mut ftp_stream: FtpStream) {
        if let Err(e) = ftp_stream.quit() {
            warn!(error = %e, "Failed to quit FTP session gracefully");
        }
    }

    fn list_sync(config: &FtpConfig) -> SyncResult<Vec<FtpEntry>> {
        let mut ftp_stream = Self::open_session(config)?;

        let dir = if config.path.is_empty() { None } else { Some(config.path.as_str()) };
        debug!(path = ?dir, "Listing directory");
        let lines = ftp_stream
            .list(dir)
            .map_err(|e| Self::map_error(config, Stage::Transfer, e));

        Self::close_session(ftp_stream);
        Ok(lines?.iter().filter_map(|line| FtpEntry::parse(line)).collect())
    }

    fn download_sync(config: &FtpConfig, remote: &str, dest: &std::path::Path, gunzip: bool) -> SyncResult<u64> {
        let mut ftp_stream = Self::open_session(config)?;

        ftp_stream
            .transfer_type(suppaftp::types::FileType::Binary)
            .map_err(|e| Self::map_error(config, Stage::Transfer, e))?;

        debug!(remote, dest = %dest.display(), "Downloading file");
        let result = ftp_stream
            .retr(remote, |reader| spool_to_file(reader, dest, gunzip).map_err(FtpError::ConnectionError))
            .map_err(|e| Self::map_error(config, Stage::Transfer, e));

        Self::close_session(ftp_stream);
        result
    }
}

#[async_trait]
impl SourceConnector for FtpConnector {
    fn kind(&self) -> &'static str {
        "ftp"
    }

    async fn list(&self) -> SyncResult<Vec<FileDescriptor>> {
        let config = self.config.clone();
        let entries = tokio::task::spawn_blocking(move || Self::list_sync(&config))
            .await
            .map_err(|e| SyncError::connection(&self.config.host, format!("FTP LIST task panicked: {}", e)))??;

        let mut files: Vec<FileDescriptor> = entries
            .into_iter()
            .filter(|e| !e.is_directory && matches_pattern(&e.name, &self.config.pattern))
            .map(|e| FileDescriptor {
                name: e.name,
                size: e.size.unwrap_or(0),
            })
            .collect();
        order_largest_first(&mut files);

        info!(host = %self.config.host, files = files.len(), "Listed FTP source");
        Ok(files)
    }

    async fn download(&self, file: &FileDescriptor) -> SyncResult<ByteStream> {
        let config = self.config.clone();
        let remote = self.remote_path(&file.name);
        let dest = spool_path(&self.cache_dir, &file.name);
        let gunzip = is_gzip(&file.name);

        let task_dest = dest.clone();
        let bytes = tokio::task::spawn_blocking(move || Self::download_sync(&config, &remote, &task_dest, gunzip))
            .await
            .map_err(|e| SyncError::connection(&self.config.host, format!("FTP download task panicked: {}", e)))??;

        info!(file = %file.name, bytes, "Downloaded file");
        let spooled = tokio::fs::File::open(&dest).await?;
        Ok(Box::new(spooled))
    }
}

/// Parsed FTP directory entry
#[derive(Debug, Clone)]
pub struct FtpEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
}

impl FtpEntry {
    /// Parse a Unix-style LIST line
    ///
    /// `-rw-r--r--   1 ftp ftp  1234 Jan 15 12:00 stock price_DS1_part1.csv`
    ///
    /// File names may contain spaces, so everything after the time/year
    /// column is the name.
    pub fn parse(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }

        let is_directory = parts[0].starts_with('d');
        let name = if parts.len() >= 9 {
            parts[8..].join(" ")
        } else {
            parts.last()?.to_string()
        };
        let size = if parts.len() >= 5 { parts[4].parse().ok() } else { None };

        Some(Self {
            name,
            is_directory,
            size,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_entry_with_spaces() {
        let entry =
            FtpEntry::parse("-rw-r--r--   1 ftp ftp  123456 Jan 15 12:00 APMG price 1 day_DS1_part1.csv").unwrap();
        assert_eq!(entry.name, "APMG price 1 day_DS1_part1.csv");
        assert!(!entry.is_directory);
        assert_eq!(entry.size, Some(123456));
    }

    #[test]
    fn test_parse_directory_entry() {
        let entry = FtpEntry::parse("drwxr-xr-x   2 ftp ftp  4096 Jan 15 12:00 archive").unwrap();
        assert_eq!(entry.name, "archive");
        assert!(entry.is_directory);
    }

    #[test]
    fn test_parse_empty_line() {
        assert!(FtpEntry::parse("").is_none());
        assert!(FtpEntry::parse("   ").is_none());
    }

    #[test]
    fn test_remote_path_and_redacted_debug() {
        let connector = FtpConnector::new(
            FtpConfig {
                host: "ftp.supplier.example".into(),
                port: 21,
                username: "feed".into(),
                password: Secret::new("s3cret"),
                path: "/exports/".into(),
                pattern: ".csv".into(),
                connect_timeout: Duration::from_secs(5),
                request_timeout: Duration::from_secs(30),
            },
            PathBuf::from("/tmp/cache"),
        );
        assert_eq!(connector.remote_path("a.csv"), "/exports/a.csv");
        assert!(!format!("{:?}", connector).contains("s3cret"));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let connector = FtpConnector::new(
            FtpConfig {
                host: "127.0.0.1".into(),
                port: 1,
                username: "anonymous".into(),
                password: Secret::new("x"),
                path: String::new(),
                pattern: ".csv".into(),
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_secs(2),
            },
            std::env::temp_dir(),
        );
        let err = connector.list().await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {}", err);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        // Accepts connections (kernel backlog) but never sends a greeting
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let connector = FtpConnector::new(
            FtpConfig {
                host: "127.0.0.1".into(),
                port,
                username: "anonymous".into(),
                password: Secret::new("x"),
                path: String::new(),
                pattern: ".csv".into(),
                connect_timeout: Duration::from_secs(2),
                request_timeout: Duration::from_millis(200),
            },
            std::env::temp_dir(),
        );

        let err = tokio::time::timeout(Duration::from_secs(10), connector.list())
            .await
            .expect("list should give up on a silent server")
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout(_)), "unexpected error: {}", err);
        assert!(err.is_transient());
        drop(listener);
    }
}
