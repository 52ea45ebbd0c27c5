//! Paginated HTTP API source
//!
//! Records are read page by page with a `cursor` query parameter. Requests
//! are spaced at least `min_interval` apart and never reuse a pooled
//! connection.

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::{ByteStream, FileDescriptor, Page, SourceConnector};
use crate::error::{SyncError, SyncResult};
use crate::models::Secret;

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub token: Option<Secret>,
    pub records_pointer: String,
    pub cursor_pointer: String,
    pub page_size: Option<u32>,
    pub min_interval: Duration,
}

#[derive(Debug)]
pub struct HttpConnector {
    config: HttpSourceConfig,
    url: Url,
    client: Client,
    last_request: Mutex<Option<Instant>>,
}

impl HttpConnector {
    pub fn new(config: HttpSourceConfig, connect_timeout: Duration, request_timeout: Duration) -> SyncResult<Self> {
        let url = Url::parse(&config.base_url)
            .map_err(|e| SyncError::Config(format!("invalid API url {}: {}", config.base_url, e)))?;

        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|e| SyncError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            config,
            url,
            client,
            last_request: Mutex::new(None),
        })
    }

    fn host(&self) -> String {
        self.url.host_str().unwrap_or("api").to_string()
    }

    /// Name the feed is recorded under as its "source file"
    pub fn feed_name(&self) -> String {
        self.url
            .path_segments()
            .and_then(|segments| segments.filter(|s| !s.is_empty()).last().map(str::to_string))
            .unwrap_or_else(|| self.host())
    }

    async fn pace(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.config.min_interval {
                tokio::time::sleep(self.config.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    fn check_status(&self, status: StatusCode, retry_after: Option<Duration>) -> SyncResult<()> {
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SyncError::Auth(format!(
                "{} rejected the API credentials ({})",
                self.host(),
                status
            ))),
            StatusCode::TOO_MANY_REQUESTS => Err(SyncError::RateLimited {
                target: self.host(),
                retry_after,
            }),
            s => Err(SyncError::Http {
                target: self.host(),
                status: s.as_u16(),
                message: s.canonical_reason().unwrap_or("unexpected status").to_string(),
            }),
        }
    }
}

/// `Retry-After` in seconds, when present
pub(crate) fn retry_after(headers: &header::HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn cursor_value(value: Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl SourceConnector for HttpConnector {
    fn kind(&self) -> &'static str {
        "http"
    }

    fn is_paginated(&self) -> bool {
        true
    }

    async fn list(&self) -> SyncResult<Vec<FileDescriptor>> {
        Ok(vec![FileDescriptor {
            name: self.feed_name(),
            size: 0,
        }])
    }

    async fn download(&self, _file: &FileDescriptor) -> SyncResult<ByteStream> {
        Err(SyncError::Config(
            "API sources are read page by page, not downloaded".to_string(),
        ))
    }

    async fn fetch_page(&self, cursor: Option<&str>) -> SyncResult<Page> {
        self.pace().await;

        let mut request = self.client.get(self.url.clone());
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token.expose());
        }
        if let Some(limit) = self.config.page_size {
            request = request.query(&[("limit", limit.to_string())]);
        }
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = request.send().await?;
        self.check_status(response.status(), retry_after(response.headers()))?;

        let mut body: Value = response.json().await?;
        let records = match body.pointer_mut(&self.config.records_pointer).map(Value::take) {
            Some(Value::Array(records)) => records,
            _ => match body.take() {
                Value::Array(records) => records,
                _ => {
                    return Err(SyncError::invalid_file(
                        self.feed_name(),
                        format!("no record array at {}", self.config.records_pointer),
                    ))
                },
            },
        };
        let next_cursor = body.pointer_mut(&self.config.cursor_pointer).map(Value::take).and_then(cursor_value);

        debug!(records = records.len(), has_next = next_cursor.is_some(), "Fetched page");
        Ok(Page { records, next_cursor })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header as header_is, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base_url: String) -> HttpConnector {
        HttpConnector::new(
            HttpSourceConfig {
                base_url,
                token: Some(Secret::new("t0ken")),
                records_pointer: "/data".into(),
                cursor_pointer: "/nextCursor".into(),
                page_size: Some(2),
                min_interval: Duration::from_millis(0),
            },
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_pages_follow_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/parts"))
            .and(query_param("cursor", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"sku": "C"}],
                "nextCursor": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/parts"))
            .and(header_is("authorization", "Bearer t0ken"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"sku": "A"}, {"sku": "B"}],
                "nextCursor": "p2"
            })))
            .mount(&server)
            .await;

        let connector = connector(format!("{}/v1/parts", server.uri()));
        assert_eq!(connector.feed_name(), "parts");

        let first = connector.fetch_page(None).await.unwrap();
        assert_eq!(first.records.len(), 2);
        assert_eq!(first.next_cursor.as_deref(), Some("p2"));

        let second = connector.fetch_page(Some("p2")).await.unwrap();
        assert_eq!(second.records.len(), 1);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(path("/auth"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;
        Mock::given(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = connector(format!("{}/auth", server.uri())).fetch_page(None).await.unwrap_err();
        assert!(err.is_fatal());

        let err = connector(format!("{}/busy", server.uri())).fetch_page(None).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::RateLimited { retry_after: Some(d), .. } if d == Duration::from_secs(3)
        ));

        let err = connector(format!("{}/down", server.uri())).fetch_page(None).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = HttpConnector::new(
            HttpSourceConfig {
                base_url: "not a url".into(),
                token: None,
                records_pointer: "/data".into(),
                cursor_pointer: "/next".into(),
                page_size: None,
                min_interval: Duration::ZERO,
            },
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
