//! Offline transform of a directory of CSV exports
//!
//! Every `<name>.csv` (or `.csv.gz`) becomes `<name>.ndjson` (one part
//! document per line, for bulk import into the document store) and
//! `<name>.bulk` (an Elasticsearch `_bulk` body). Rows go through the same
//! normalizer as the sync pipeline.

use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_CURRENCY, DEFAULT_ELASTICSEARCH_INDEX, DEFAULT_LOW_STOCK_THRESHOLD};
use crate::connector::{FileDescriptor, LocalConnector, SourceConnector};
use crate::error::{SyncError, SyncResult};
use crate::normalize::{Batcher, CsvRecordStream, NormalizeContext};

const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub integration_id: Uuid,
    pub integration_name: String,
    pub index: String,
    pub default_currency: String,
    pub low_stock_threshold: i64,
    pub pattern: String,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            integration_id: Uuid::nil(),
            integration_name: "offline".to_string(),
            index: DEFAULT_ELASTICSEARCH_INDEX.to_string(),
            default_currency: DEFAULT_CURRENCY.to_string(),
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            pattern: ".csv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub file: String,
    pub records: u64,
    pub rejected: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformSummary {
    pub files: Vec<FileSummary>,
    pub records: u64,
    pub rejected: u64,
    pub failed_files: u64,
}

/// Output stem for a source file: `stock.csv.gz` → `stock`
fn output_stem(name: &str) -> String {
    let base = name.strip_suffix(".gz").unwrap_or(name);
    Path::new(base)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| base.to_string())
}

pub async fn transform_directory(input: &Path, output: &Path, options: &TransformOptions) -> SyncResult<TransformSummary> {
    tokio::fs::create_dir_all(output).await?;
    let scratch = scratch_dir(output);
    let connector = LocalConnector::new(input.to_path_buf(), options.pattern.clone(), scratch.clone());

    let files = connector.list().await?;
    info!(input = %input.display(), files = files.len(), "Transforming directory");

    let mut summary = TransformSummary::default();
    for file in files {
        let result = transform_file(&connector, &file.name, output, options).await;
        let file_summary = match result {
            Ok(done) => done,
            Err(e) => {
                warn!(file = %file.name, error = %e, "Transform failed");
                summary.failed_files += 1;
                FileSummary {
                    file: file.name.clone(),
                    error: Some(e.to_string()),
                    ..FileSummary::default()
                }
            },
        };
        summary.records += file_summary.records;
        summary.rejected += file_summary.rejected;
        summary.files.push(file_summary);
    }

    if tokio::fs::try_exists(&scratch).await.unwrap_or(false) {
        tokio::fs::remove_dir_all(&scratch).await?;
    }

    info!(
        files = summary.files.len(),
        records = summary.records,
        rejected = summary.rejected,
        failed_files = summary.failed_files,
        "Transform complete"
    );
    Ok(summary)
}

fn scratch_dir(output: &Path) -> PathBuf {
    output.join(format!(".decompress-{}", Uuid::new_v4()))
}

async fn transform_file(
    connector: &LocalConnector,
    name: &str,
    output: &Path,
    options: &TransformOptions,
) -> SyncResult<FileSummary> {
    let descriptor = FileDescriptor {
        name: name.to_string(),
        size: 0,
    };
    let source = connector.download(&descriptor).await?;

    let context = NormalizeContext::new(options.integration_id, &options.integration_name, name).with_defaults(
        options.default_currency.clone(),
        None,
        options.low_stock_threshold,
    );
    let stream = CsvRecordStream::open(source, context, &Default::default()).await?;
    let mut batcher = Batcher::new(Box::new(stream), DEFAULT_BATCH_SIZE);

    let stem = output_stem(name);
    let mut ndjson = BufWriter::with_capacity(
        WRITE_BUFFER_BYTES,
        tokio::fs::File::create(output.join(format!("{}.ndjson", stem))).await?,
    );
    let mut bulk = BufWriter::with_capacity(
        WRITE_BUFFER_BYTES,
        tokio::fs::File::create(output.join(format!("{}.bulk", stem))).await?,
    );

    let mut summary = FileSummary {
        file: name.to_string(),
        ..FileSummary::default()
    };
    let mut line = Vec::with_capacity(1024);

    while let Some(batch) = batcher.next_batch().await? {
        summary.rejected += batch.rejected;
        for record in &batch.records {
            line.clear();
            serde_json::to_writer(&mut line, record)?;
            line.push(b'\n');
            ndjson.write_all(&line).await?;

            let action = json!({ "index": { "_index": options.index, "_id": record.search_id() } });
            bulk.write_all(serde_json::to_string(&action)?.as_bytes()).await?;
            bulk.write_all(b"\n").await?;
            bulk.write_all(&line).await?;
        }
        summary.records += batch.records.len() as u64;
    }

    ndjson.flush().await?;
    bulk.flush().await?;

    if summary.records == 0 && summary.rejected > 0 {
        return Err(SyncError::invalid_file(name, format!("all {} rows rejected", summary.rejected)));
    }

    info!(file = name, records = summary.records, rejected = summary.rejected, "Transformed file");
    Ok(summary)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem("stock.csv"), "stock");
        assert_eq!(output_stem("stock_DS1_part1.csv.gz"), "stock_DS1_part1");
    }

    #[tokio::test]
    async fn test_transform_writes_ndjson_and_bulk() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        std::fs::write(
            input.path().join("feed_DS1_part1.csv"),
            "Part Number;Price;Qty\nABC-1;10,50;5\n;3;1\nXYZ-2;20;0\n",
        )
        .unwrap();

        let summary = transform_directory(input.path(), output.path(), &TransformOptions::default())
            .await
            .unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.failed_files, 0);

        let ndjson = std::fs::read_to_string(output.path().join("feed_DS1_part1.ndjson")).unwrap();
        let docs: Vec<Value> = ndjson.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["partNumber"], "ABC-1");
        assert_eq!(docs[0]["price"], 10.5);
        assert_eq!(docs[0]["stockCode"], "DS1");

        let bulk = std::fs::read_to_string(output.path().join("feed_DS1_part1.bulk")).unwrap();
        let lines: Vec<&str> = bulk.lines().collect();
        assert_eq!(lines.len(), 4);
        let action: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(action["index"]["_index"], "parts");

        // Scratch space is cleaned up
        let leftovers: Vec<_> = std::fs::read_dir(output.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".decompress"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
