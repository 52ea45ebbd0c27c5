//! Pull-based record streams
//!
//! Nothing is read from the source until the consumer asks for the next
//! record, so a slow batch write naturally stops the download/parse side.
//! [`Batcher`] groups outcomes into bounded batches for the writer.

use async_trait::async_trait;
use csv_async::{AsyncReader, AsyncReaderBuilder, StringRecord, Trim};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, warn};

use super::{detect_delimiter, ColumnLayout, NormalizeContext, NormalizeOutcome, Normalizer, RejectReason};
use crate::connector::SourceConnector;
use crate::error::{SyncError, SyncResult};
use crate::models::{Field, PartRecord};
use crate::resilience::RetryPolicy;

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[async_trait]
pub trait RecordStream: Send {
    /// Next normalized row, `None` at end of input
    async fn next_record(&mut self) -> SyncResult<Option<NormalizeOutcome>>;
}

/// Streams a delimited text file row by row
pub struct CsvRecordStream<R> {
    reader: AsyncReader<BufReader<R>>,
    layout: ColumnLayout,
    normalizer: Normalizer,
    record: StringRecord,
}

impl<R> CsvRecordStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Sniff the delimiter, read the header row and resolve the column layout
    ///
    /// Fails for the whole file when no column maps to a part number.
    pub async fn open(
        source: R,
        context: NormalizeContext,
        overrides: &BTreeMap<Field, String>,
    ) -> SyncResult<Self> {
        let mut buffered = BufReader::with_capacity(READ_BUFFER_BYTES, source);
        let delimiter = detect_delimiter(buffered.fill_buf().await?);

        let mut reader = AsyncReaderBuilder::new()
            .delimiter(delimiter)
            .flexible(true)
            .trim(Trim::All)
            .create_reader(buffered);

        let headers: Vec<String> = reader
            .headers()
            .await
            .map_err(|e| SyncError::invalid_file(&context.file_name, format!("unreadable header row: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();

        let layout = ColumnLayout::resolve(&headers, overrides);
        if !layout.has(Field::PartNumber) {
            return Err(SyncError::invalid_file(
                &context.file_name,
                format!("no part number column among {:?}", headers),
            ));
        }

        debug!(
            file = %context.file_name,
            delimiter = %(delimiter as char).escape_default(),
            columns = ?layout.fields().map(|(f, i)| (f.as_str(), i)).collect::<Vec<_>>(),
            "Resolved column layout"
        );

        Ok(Self {
            reader,
            layout,
            normalizer: Normalizer::new(context),
            record: StringRecord::new(),
        })
    }
}

#[async_trait]
impl<R> RecordStream for CsvRecordStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn next_record(&mut self) -> SyncResult<Option<NormalizeOutcome>> {
        match self.reader.read_record(&mut self.record).await {
            Ok(false) => Ok(None),
            Ok(true) => {
                let values: Vec<&str> = self.record.iter().collect();
                Ok(Some(self.normalizer.normalize(&self.layout, &values)))
            },
            Err(e) => match e.into_kind() {
                csv_async::ErrorKind::Io(io) => Err(SyncError::Io(io)),
                other => Ok(Some(NormalizeOutcome::Rejected(RejectReason::MalformedRow(format!(
                    "{:?}",
                    other
                ))))),
            },
        }
    }
}

/// Streams records from a paginated JSON API
///
/// Pages are fetched lazily through the connector with retry; the column
/// layout is re-resolved whenever a record's key set changes.
pub struct ApiRecordStream {
    connector: Arc<dyn SourceConnector>,
    retry: RetryPolicy,
    normalizer: Normalizer,
    overrides: BTreeMap<Field, String>,
    buffer: VecDeque<Value>,
    cursor: Option<String>,
    exhausted: bool,
    pages: u64,
    keys: Vec<String>,
    layout: ColumnLayout,
}

impl ApiRecordStream {
    pub fn new(
        connector: Arc<dyn SourceConnector>,
        retry: RetryPolicy,
        context: NormalizeContext,
        overrides: BTreeMap<Field, String>,
    ) -> Self {
        Self {
            connector,
            retry,
            normalizer: Normalizer::new(context),
            overrides,
            buffer: VecDeque::new(),
            cursor: None,
            exhausted: false,
            pages: 0,
            keys: Vec::new(),
            layout: ColumnLayout::default(),
        }
    }

    async fn fill(&mut self) -> SyncResult<()> {
        while self.buffer.is_empty() && !self.exhausted {
            let connector = self.connector.clone();
            let cursor = self.cursor.clone();
            let page = self
                .retry
                .run("fetch page", || {
                    let connector = connector.clone();
                    let cursor = cursor.clone();
                    async move { connector.fetch_page(cursor.as_deref()).await }
                })
                .await?;

            self.pages += 1;
            debug!(page = self.pages, records = page.records.len(), "Fetched API page");
            self.exhausted = page.next_cursor.is_none();
            self.cursor = page.next_cursor;
            self.buffer.extend(page.records);
        }
        Ok(())
    }

    fn normalize_value(&mut self, value: Value) -> NormalizeOutcome {
        let Value::Object(object) = value else {
            return NormalizeOutcome::Rejected(RejectReason::MalformedRow("record is not a JSON object".into()));
        };

        if object.len() != self.keys.len() || object.keys().zip(&self.keys).any(|(a, b)| a != b) {
            self.keys = object.keys().cloned().collect();
            self.layout = ColumnLayout::resolve(&self.keys, &self.overrides);
        }

        let values: Vec<String> = object.into_iter().map(|(_, v)| json_cell(v)).collect();
        self.normalizer.normalize(&self.layout, &values)
    }
}

fn json_cell(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s,
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[async_trait]
impl RecordStream for ApiRecordStream {
    async fn next_record(&mut self) -> SyncResult<Option<NormalizeOutcome>> {
        self.fill().await?;
        match self.buffer.pop_front() {
            Some(value) => Ok(Some(self.normalize_value(value))),
            None => Ok(None),
        }
    }
}

/// One bounded group of accepted records plus the rows rejected while filling it
#[derive(Debug, Default)]
pub struct Batch {
    pub records: Vec<PartRecord>,
    pub rejected: u64,
}

impl Batch {
    /// Rows consumed from the source for this batch
    pub fn rows(&self) -> u64 {
        self.records.len() as u64 + self.rejected
    }
}

/// Groups a record stream into batches of at most `batch_size` records
pub struct Batcher {
    stream: Box<dyn RecordStream>,
    batch_size: usize,
    finished: bool,
}

impl Batcher {
    pub fn new(stream: Box<dyn RecordStream>, batch_size: usize) -> Self {
        Self {
            stream,
            batch_size: batch_size.max(1),
            finished: false,
        }
    }

    /// Pull rows until the batch is full or the stream ends
    ///
    /// Returns `None` once the stream is exhausted and nothing is pending.
    pub async fn next_batch(&mut self) -> SyncResult<Option<Batch>> {
        if self.finished {
            return Ok(None);
        }

        let mut batch = Batch {
            records: Vec::with_capacity(self.batch_size),
            rejected: 0,
        };

        while batch.records.len() < self.batch_size {
            match self.stream.next_record().await? {
                Some(NormalizeOutcome::Accepted(record)) => batch.records.push(record),
                Some(NormalizeOutcome::Rejected(reason)) => {
                    if let RejectReason::MalformedRow(detail) = &reason {
                        warn!(detail = %detail, "Skipping malformed row");
                    }
                    batch.rejected += 1;
                },
                None => {
                    self.finished = true;
                    break;
                },
            }
        }

        if batch.rows() == 0 {
            return Ok(None);
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn context(file: &str) -> NormalizeContext {
        NormalizeContext::new(Uuid::nil(), "test", file)
    }

    async fn open(data: &'static str) -> SyncResult<CsvRecordStream<&'static [u8]>> {
        CsvRecordStream::open(data.as_bytes(), context("stock.csv"), &BTreeMap::new()).await
    }

    #[tokio::test]
    async fn test_semicolon_file_streams_rows() {
        let mut stream = open("Part Number;Price;Qty\nA-1;12,50;3\nB-2;1.234,00;0\n").await.unwrap();

        let first = stream.next_record().await.unwrap().unwrap();
        let NormalizeOutcome::Accepted(first) = first else { panic!("rejected") };
        assert_eq!(first.part_number, "A-1");
        assert_eq!(first.price, Some(12.5));

        let NormalizeOutcome::Accepted(second) = stream.next_record().await.unwrap().unwrap() else {
            panic!("rejected")
        };
        assert_eq!(second.price, Some(1234.0));
        assert!(stream.next_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_without_part_number_column_fails() {
        let err = open("description,price\nfoo,1\n").await.err().unwrap();
        assert!(matches!(err, SyncError::InvalidFile { .. }));
    }

    #[tokio::test]
    async fn test_batcher_bounds_and_counts_rejections() {
        let stream = open("sku,qty\nA,1\n,2\nB,3\nC,4\n").await.unwrap();
        let mut batcher = Batcher::new(Box::new(stream), 2);

        let first = batcher.next_batch().await.unwrap().unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.rejected, 1);

        let second = batcher.next_batch().await.unwrap().unwrap();
        assert_eq!(second.records.len(), 1);
        assert_eq!(second.records[0].part_number, "C");

        assert!(batcher.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ragged_rows_are_tolerated() {
        let mut stream = open("sku,description,price\nA\nB,Filter,5,extra\n").await.unwrap();
        let NormalizeOutcome::Accepted(a) = stream.next_record().await.unwrap().unwrap() else {
            panic!("rejected")
        };
        assert_eq!(a.price, None);
        let NormalizeOutcome::Accepted(b) = stream.next_record().await.unwrap().unwrap() else {
            panic!("rejected")
        };
        assert_eq!(b.price, Some(5.0));
    }
}
