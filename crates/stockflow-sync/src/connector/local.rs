//! Local directory source, used for offline transforms and drop-folder
//! integrations

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{is_gzip, matches_pattern, order_largest_first, spool_path, spool_to_file, ByteStream, FileDescriptor, SourceConnector};
use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
    pattern: String,
    cache_dir: PathBuf,
}

impl LocalConnector {
    pub fn new(root: PathBuf, pattern: String, cache_dir: PathBuf) -> Self {
        Self {
            root,
            pattern,
            cache_dir,
        }
    }
}

#[async_trait]
impl SourceConnector for LocalConnector {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn list(&self) -> SyncResult<Vec<FileDescriptor>> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            SyncError::Config(format!("cannot read source directory {}: {}", self.root.display(), e))
        })?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if matches_pattern(&name, &self.pattern) {
                files.push(FileDescriptor {
                    name,
                    size: metadata.len(),
                });
            }
        }
        order_largest_first(&mut files);

        info!(root = %self.root.display(), files = files.len(), "Listed local source");
        Ok(files)
    }

    async fn download(&self, file: &FileDescriptor) -> SyncResult<ByteStream> {
        let source = self.root.join(&file.name);
        if !is_gzip(&file.name) {
            let opened = tokio::fs::File::open(&source)
                .await
                .map_err(|e| SyncError::invalid_file(&file.name, e.to_string()))?;
            return Ok(Box::new(opened));
        }

        let dest = spool_path(&self.cache_dir, &file.name);
        let task_dest = dest.clone();
        let bytes = tokio::task::spawn_blocking(move || -> std::io::Result<u64> {
            let mut input = std::fs::File::open(&source)?;
            spool_to_file(&mut input, &task_dest, true)
        })
        .await
        .map_err(|e| SyncError::invalid_file(&file.name, format!("decompression task panicked: {}", e)))?
        .map_err(|e| SyncError::invalid_file(&file.name, e.to_string()))?;

        debug!(file = %file.name, bytes, "Decompressed local file");
        Ok(Box::new(tokio::fs::File::open(&dest).await?))
    }
}
