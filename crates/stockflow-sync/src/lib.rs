//! Stockflow Sync
//!
//! Bulk ingestion of supplier inventory exports into two stores: Postgres
//! (the system of record for parts) and Elasticsearch (the search index).
//!
//! A sync run lists an integration's source (FTP, HTTP API or a local
//! directory), streams every file through the row normalizer in batches and
//! writes each batch to both stores behind retries and circuit breakers.
//! Progress is published while the run is live; a history record is kept
//! once it ends.
//!
//! # Module Organization
//!
//! - [`connector`] - Source listing and downloads
//! - [`normalize`] - Header detection, row normalization and batching
//! - [`store`] - Document store and search index backends
//! - [`writer`] - Dual-store batch writer
//! - [`resilience`] - Retry, circuit breaking, memory watchdog, log throttling
//! - [`state`] - Integrations, the request queue, progress and history
//! - [`orchestrator`] - Run lifecycle and the worker poll loop
//! - [`transform`] - Offline CSV to NDJSON / bulk-body conversion

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod connector;
pub mod db;
pub mod error;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod resilience;
pub mod state;
pub mod store;
pub mod transform;
pub mod writer;

pub use config::SyncConfig;
pub use error::{SyncError, SyncResult};
pub use models::{Integration, PartRecord, RunHistory, SyncProgress, SyncRequest};
pub use orchestrator::{SyncDependencies, SyncOrchestrator, SyncWorker};
