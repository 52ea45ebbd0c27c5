//! Elasticsearch search index over plain HTTP
//!
//! Writes go through `_bulk` with an NDJSON body. Per-document errors in the
//! bulk response are counted, not raised; only transport failures, 5xx and
//! 429 come back as errors so the caller can back off.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BulkIndexReport, SearchIndex};
use crate::config::SearchConfig;
use crate::connector::http::retry_after;
use crate::error::{SyncError, SyncResult};
use crate::models::PartRecord;

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug)]
pub struct ElasticsearchIndex {
    client: Client,
    base_url: Url,
    index: String,
    count_cache_ttl: Duration,
    count_cache: Mutex<HashMap<Option<Uuid>, (Instant, u64)>>,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    /// Each item is `{"<action>": {...}}`
    #[serde(default)]
    items: Vec<HashMap<String, BulkItem>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
}

impl ElasticsearchIndex {
    pub fn new(config: &SearchConfig) -> SyncResult<Self> {
        let mut raw = config.url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base_url = Url::parse(&raw)
            .map_err(|e| SyncError::Config(format!("invalid search index url {}: {}", config.url, e)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build search index client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            index: config.index.clone(),
            count_cache_ttl: config.count_cache_ttl(),
            count_cache: Mutex::new(HashMap::new()),
        })
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| SyncError::Config(format!("invalid search index path {}: {}", path, e)))
    }

    fn target(&self) -> String {
        self.base_url.host_str().unwrap_or("elasticsearch").to_string()
    }

    /// Map a non-success status to the error the resilience layer expects
    async fn check(&self, response: reqwest::Response) -> SyncResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SyncError::RateLimited {
                target: self.target(),
                retry_after: retry_after(response.headers()),
            });
        }
        let message = response.text().await.unwrap_or_default();
        Err(SyncError::Http {
            target: self.target(),
            status: status.as_u16(),
            message: message.chars().take(512).collect(),
        })
    }

    /// Exact match on the integration id
    ///
    /// The index is dynamically mapped, so `integration` is an analyzed text
    /// field that splits a UUID on its hyphens; its `keyword` sub-field holds
    /// the whole value.
    pub(crate) fn integration_query(integration_id: Uuid) -> Value {
        json!({ "query": { "term": { "integration.keyword": integration_id.to_string() } } })
    }

    fn clear_count_cache(&self) {
        self.count_cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

/// `_bulk` body: one action line plus one document line per record
pub fn bulk_body(index: &str, records: &[PartRecord]) -> SyncResult<String> {
    let mut body = String::with_capacity(records.len() * 512);
    for record in records {
        let action = json!({ "index": { "_index": index, "_id": record.search_id() } });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(record)?);
        body.push('\n');
    }
    Ok(body)
}

#[async_trait]
impl SearchIndex for ElasticsearchIndex {
    fn name(&self) -> &'static str {
        "elasticsearch"
    }

    async fn bulk_index(&self, records: &[PartRecord]) -> SyncResult<BulkIndexReport> {
        if records.is_empty() {
            return Ok(BulkIndexReport::default());
        }

        let response = self
            .client
            .post(self.endpoint("_bulk")?)
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(bulk_body(&self.index, records)?)
            .send()
            .await?;
        let parsed: BulkResponse = self.check(response).await?.json().await?;

        let mut report = BulkIndexReport::default();
        let mut first_error: Option<Value> = None;
        for item in parsed.items.into_iter().flat_map(HashMap::into_values) {
            if item.error.is_some() || item.status >= 300 {
                report.failed += 1;
                if first_error.is_none() {
                    first_error = item.error;
                }
            } else {
                report.indexed += 1;
            }
        }

        if parsed.errors {
            let first_error = first_error.unwrap_or_default();
            warn!(
                failed = report.failed,
                indexed = report.indexed,
                first_error = %first_error,
                "Bulk index reported per-document errors"
            );
        }
        debug!(indexed = report.indexed, failed = report.failed, "Bulk indexed parts");
        Ok(report)
    }

    async fn refresh(&self) -> SyncResult<()> {
        let response = self
            .client
            .post(self.endpoint(&format!("{}/_refresh", self.index))?)
            .send()
            .await?;
        self.check(response).await?;
        self.clear_count_cache();
        Ok(())
    }

    async fn count(&self, integration_id: Option<Uuid>) -> SyncResult<u64> {
        {
            let cache = self.count_cache.lock().unwrap_or_else(|p| p.into_inner());
            if let Some((at, count)) = cache.get(&integration_id) {
                if at.elapsed() < self.count_cache_ttl {
                    return Ok(*count);
                }
            }
        }

        let mut request = self.client.post(self.endpoint(&format!("{}/_count", self.index))?);
        if let Some(id) = integration_id {
            request = request.json(&Self::integration_query(id));
        }
        let parsed: CountResponse = self.check(request.send().await?).await?.json().await?;

        self.count_cache
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(integration_id, (Instant::now(), parsed.count));
        Ok(parsed.count)
    }

    async fn delete_by_integration(&self, integration_id: Uuid) -> SyncResult<u64> {
        let response = self
            .client
            .post(self.endpoint(&format!("{}/_delete_by_query", self.index))?)
            .query(&[("conflicts", "proceed"), ("refresh", "true")])
            .json(&Self::integration_query(integration_id))
            .send()
            .await?;
        let parsed: DeleteByQueryResponse = self.check(response).await?.json().await?;
        self.clear_count_cache();
        Ok(parsed.deleted)
    }

    fn release_caches(&self) {
        self.clear_count_cache();
    }
}
