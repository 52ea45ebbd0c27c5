//! Domain types shared across the pipeline
//!
//! Part records, integrations, sync requests and the progress/history
//! documents exposed to operators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

// ============================================================================
// Part records
// ============================================================================

/// Availability derived from quantity at write time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
    OnOrder,
    #[default]
    Unknown,
}

impl StockStatus {
    /// Derive the status of a row
    ///
    /// `quantity` is `None` only when the file has no quantity column at all.
    pub fn derive(quantity: Option<i64>, on_order: bool, low_stock_threshold: i64) -> Self {
        if on_order {
            return StockStatus::OnOrder;
        }
        match quantity {
            None => StockStatus::Unknown,
            Some(q) if q <= 0 => StockStatus::OutOfStock,
            Some(q) if q <= low_stock_threshold => StockStatus::LowStock,
            Some(_) => StockStatus::InStock,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::InStock => "in-stock",
            StockStatus::LowStock => "low-stock",
            StockStatus::OutOfStock => "out-of-stock",
            StockStatus::OnOrder => "on-order",
            StockStatus::Unknown => "unknown",
        }
    }
}

/// One normalized supplier inventory row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartRecord {
    pub part_number: String,
    pub description: Option<String>,
    pub brand: Option<String>,
    pub supplier: Option<String>,
    pub price: Option<f64>,
    pub currency: String,
    pub quantity: i64,
    pub stock_status: StockStatus,
    pub min_order_qty: i64,
    pub stock_code: Option<String>,
    pub origin: Option<String>,
    pub weight: Option<f64>,
    pub weight_unit: String,
    pub volume: Option<f64>,
    pub delivery_days: Option<i32>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    #[serde(rename = "integration")]
    pub integration_id: Uuid,
    pub integration_name: String,
    pub file_name: String,
    pub imported_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl PartRecord {
    /// Document-store identity
    pub fn key(&self) -> (&str, Uuid, &str) {
        (&self.part_number, self.integration_id, &self.file_name)
    }

    /// Stable search-index document id for this record's key
    pub fn search_id(&self) -> String {
        search_id(self.integration_id, &self.file_name, &self.part_number)
    }
}

/// `sha256(integration | file | part number)` as lowercase hex
pub fn search_id(integration_id: Uuid, file_name: &str, part_number: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(integration_id.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(file_name.as_bytes());
    hasher.update(b"|");
    hasher.update(part_number.as_bytes());
    hex::encode(hasher.finalize())
}

/// Logical fields a source column can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    PartNumber,
    Description,
    Brand,
    Supplier,
    Price,
    Currency,
    Quantity,
    MinOrderQty,
    StockCode,
    /// Free-text availability, e.g. "on order"
    Stock,
    WeightUnit,
    Weight,
    Volume,
    DeliveryDays,
    Origin,
    Subcategory,
    Category,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::PartNumber => "part_number",
            Field::Description => "description",
            Field::Brand => "brand",
            Field::Supplier => "supplier",
            Field::Price => "price",
            Field::Currency => "currency",
            Field::Quantity => "quantity",
            Field::MinOrderQty => "min_order_qty",
            Field::StockCode => "stock_code",
            Field::Stock => "stock",
            Field::WeightUnit => "weight_unit",
            Field::Weight => "weight",
            Field::Volume => "volume",
            Field::DeliveryDays => "delivery_days",
            Field::Origin => "origin",
            Field::Subcategory => "subcategory",
            Field::Category => "category",
        }
    }
}

// ============================================================================
// Integrations
// ============================================================================

/// Credential that never shows up in `Debug` output or logs
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

fn default_ftp_port() -> u16 {
    21
}

fn default_pattern() -> String {
    ".csv".to_string()
}

fn default_records_pointer() -> String {
    "/data".to_string()
}

fn default_cursor_pointer() -> String {
    "/nextCursor".to_string()
}

fn default_min_interval_ms() -> u64 {
    250
}

fn default_true() -> bool {
    true
}

/// Where an integration's raw data lives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceConfig {
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        username: String,
        password: Secret,
        /// Remote directory holding the exports
        #[serde(default)]
        path: String,
        /// File-name suffix to pick up (`.csv`, `.csv.gz`)
        #[serde(default = "default_pattern")]
        pattern: String,
    },
    Http {
        base_url: String,
        #[serde(default)]
        token: Option<Secret>,
        /// JSON pointer to the record array in each page
        #[serde(default = "default_records_pointer")]
        records_pointer: String,
        /// JSON pointer to the next-page cursor
        #[serde(default = "default_cursor_pointer")]
        cursor_pointer: String,
        #[serde(default)]
        page_size: Option<u32>,
        /// Minimum spacing between requests
        #[serde(default = "default_min_interval_ms")]
        min_interval_ms: u64,
    },
    Local {
        path: PathBuf,
        #[serde(default = "default_pattern")]
        pattern: String,
    },
}

impl SourceConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceConfig::Ftp { .. } => "ftp",
            SourceConfig::Http { .. } => "http",
            SourceConfig::Local { .. } => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

impl IntegrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationStatus::Idle => "idle",
            IntegrationStatus::Syncing => "syncing",
            IntegrationStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(IntegrationStatus::Idle),
            "syncing" => Some(IntegrationStatus::Syncing),
            "error" => Some(IntegrationStatus::Error),
            _ => None,
        }
    }
}

/// Summary of the most recent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSync {
    pub run_id: Uuid,
    pub status: RequestStatus,
    pub finished_at: DateTime<Utc>,
    pub records_processed: u64,
    pub error: Option<String>,
}

/// Cumulative counters across all runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStats {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub total_records_processed: u64,
    pub total_records_inserted: u64,
    pub last_duration_secs: f64,
}

impl IntegrationStats {
    pub fn record_run(&mut self, history: &RunHistory) {
        self.total_syncs += 1;
        match history.status {
            RequestStatus::Completed => self.successful_syncs += 1,
            _ => self.failed_syncs += 1,
        }
        self.total_records_processed += history.records_processed;
        self.total_records_inserted += history.records_inserted;
        self.last_duration_secs = history.duration_secs;
    }
}

/// Configuration and run state for one external source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceConfig,
    /// Logical field -> exact source header, consulted before the alias table
    #[serde(default)]
    pub column_overrides: BTreeMap<Field, String>,
    #[serde(default)]
    pub default_currency: Option<String>,
    #[serde(default)]
    pub default_supplier: Option<String>,
    #[serde(default)]
    pub status: IntegrationStatus,
    #[serde(default)]
    pub last_sync: Option<LastSync>,
    #[serde(default)]
    pub stats: IntegrationStats,
}

// ============================================================================
// Sync requests, progress and history
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RequestStatus::Pending),
            "processing" => Some(RequestStatus::Processing),
            "completed" => Some(RequestStatus::Completed),
            "failed" => Some(RequestStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestStatus::Completed | RequestStatus::Failed)
    }
}

/// Unit of work consumed by the worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub status: RequestStatus,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl SyncRequest {
    pub fn new(integration_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            integration_id,
            status: RequestStatus::Pending,
            requested_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Orchestrator state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    #[default]
    Idle,
    Listing,
    Downloading,
    Parsing,
    Importing,
    Indexing,
    Completed,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Listing => "listing",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Parsing => "parsing",
            SyncPhase::Importing => "importing",
            SyncPhase::Indexing => "indexing",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncPhase::Completed | SyncPhase::Failed)
    }
}

/// Live progress document polled by operators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub run_id: Uuid,
    pub integration_id: Uuid,
    pub status: RequestStatus,
    pub phase: SyncPhase,
    pub files_total: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_rejected: u64,
    pub records_indexed: u64,
    pub index_failures: u64,
    pub current_file: Option<String>,
    pub errors: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncProgress {
    pub fn new(run_id: Uuid, integration_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            integration_id,
            status: RequestStatus::Processing,
            phase: SyncPhase::Idle,
            files_total: 0,
            files_processed: 0,
            files_failed: 0,
            records_processed: 0,
            records_inserted: 0,
            records_updated: 0,
            records_rejected: 0,
            records_indexed: 0,
            index_failures: 0,
            current_file: None,
            errors: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }
}

/// Archived terminal record of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHistory {
    pub run_id: Uuid,
    pub integration_id: Uuid,
    pub status: RequestStatus,
    pub files_total: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub records_processed: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_rejected: u64,
    pub records_indexed: u64,
    pub index_failures: u64,
    pub errors: Vec<String>,
    /// Why the run failed, if it did
    pub cause: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_secs: f64,
}

impl RunHistory {
    pub fn from_progress(progress: &SyncProgress, cause: Option<String>) -> Self {
        let finished_at = Utc::now();
        Self {
            run_id: progress.run_id,
            integration_id: progress.integration_id,
            status: progress.status,
            files_total: progress.files_total,
            files_processed: progress.files_processed,
            files_failed: progress.files_failed,
            records_processed: progress.records_processed,
            records_inserted: progress.records_inserted,
            records_updated: progress.records_updated,
            records_rejected: progress.records_rejected,
            records_indexed: progress.records_indexed,
            index_failures: progress.index_failures,
            errors: progress.errors.clone(),
            cause,
            started_at: progress.started_at,
            finished_at,
            duration_secs: (finished_at - progress.started_at).num_milliseconds() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_stock_status_derivation() {
        assert_eq!(StockStatus::derive(Some(0), false, 10), StockStatus::OutOfStock);
        assert_eq!(StockStatus::derive(Some(1), false, 10), StockStatus::LowStock);
        assert_eq!(StockStatus::derive(Some(10), false, 10), StockStatus::LowStock);
        assert_eq!(StockStatus::derive(Some(11), false, 10), StockStatus::InStock);
        assert_eq!(StockStatus::derive(Some(0), true, 10), StockStatus::OnOrder);
        assert_eq!(StockStatus::derive(None, false, 10), StockStatus::Unknown);
    }

    #[test]
    fn test_search_id_is_stable_and_key_scoped() {
        let integration = Uuid::nil();
        let a = search_id(integration, "stock.csv", "ABC-1");
        assert_eq!(a, search_id(integration, "stock.csv", "ABC-1"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, search_id(integration, "other.csv", "ABC-1"));
        assert_ne!(a, search_id(Uuid::new_v4(), "stock.csv", "ABC-1"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let source = SourceConfig::Ftp {
            host: "ftp.supplier.example".into(),
            port: 21,
            username: "feed".into(),
            password: Secret::new("hunter2"),
            path: "/exports".into(),
            pattern: ".csv".into(),
        };
        let printed = format!("{:?}", source);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("***"));
    }

    #[test]
    fn test_integration_from_json_defaults() {
        let json = r#"{
            "name": "Gulf Parts",
            "source": { "type": "local", "path": "/data/gulf" },
            "columnOverrides": { "part_number": "Vendor Ref" }
        }"#;
        let integration: Integration = serde_json::from_str(json).unwrap();
        assert!(integration.enabled);
        assert_eq!(integration.status, IntegrationStatus::Idle);
        assert_eq!(
            integration.column_overrides.get(&Field::PartNumber).map(String::as_str),
            Some("Vendor Ref")
        );
        match integration.source {
            SourceConfig::Local { pattern, .. } => assert_eq!(pattern, ".csv"),
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn test_part_record_serializes_camel_case() {
        let now = Utc::now();
        let record = PartRecord {
            part_number: "ABC-1".into(),
            description: None,
            brand: None,
            supplier: None,
            price: Some(10.5),
            currency: "AED".into(),
            quantity: 5,
            stock_status: StockStatus::LowStock,
            min_order_qty: 1,
            stock_code: None,
            origin: None,
            weight: None,
            weight_unit: "kg".into(),
            volume: None,
            delivery_days: None,
            category: None,
            subcategory: None,
            integration_id: Uuid::nil(),
            integration_name: "test".into(),
            file_name: "a.csv".into(),
            imported_at: now,
            last_updated: now,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["partNumber"], "ABC-1");
        assert_eq!(value["stockStatus"], "low-stock");
        assert_eq!(value["minOrderQty"], 1);
        assert!(value.get("integration").is_some());
    }
}
