//! Shared harness for the sync pipeline integration tests
//!
//! Everything runs against the in-memory stores and a local-directory source
//! inside a temp dir, so no Postgres or Elasticsearch is needed. Retry delays
//! are cut to a few milliseconds.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use stockflow_sync::config::SyncConfig;
use stockflow_sync::models::{Integration, IntegrationStats, IntegrationStatus, RunHistory, SourceConfig};
use stockflow_sync::resilience::MemoryProbe;
use stockflow_sync::state::{MemorySyncStore, SyncStore};
use stockflow_sync::store::{MemoryDocumentStore, MemorySearchIndex, SearchIndex};
use stockflow_sync::{SyncDependencies, SyncOrchestrator, SyncResult};

/// Resident size under test control
#[derive(Debug, Default)]
pub struct FixedProbe {
    bytes: AtomicU64,
    alternate: AtomicBool,
    samples: AtomicU64,
}

impl FixedProbe {
    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }

    /// Report every other sample as far over any ceiling, so the watchdog
    /// pauses once before each batch and resumes on the next sample
    pub fn alternate(&self, enabled: bool) {
        self.samples.store(0, Ordering::SeqCst);
        self.alternate.store(enabled, Ordering::SeqCst);
    }
}

impl MemoryProbe for FixedProbe {
    fn resident_bytes(&self) -> u64 {
        if self.alternate.load(Ordering::SeqCst) && self.samples.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            return u64::MAX;
        }
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Default configuration with test-sized delays
pub fn fast_config(cache_dir: &Path) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.max_retries = 3;
    config.breaker.failure_threshold = 3;
    config.breaker.cooldown_secs = 1;
    config.breaker.max_cooldown_secs = 2;
    config.memory.ceiling_mb = 64;
    config.memory.check_interval_ms = 5;
    config.batch.search_batch_pause_ms = 0;
    config.worker.cache_dir = cache_dir.to_path_buf();
    config.worker.poll_interval_secs = 1;
    config
}

pub fn local_integration(name: &str, path: &Path) -> Integration {
    integration_with_source(
        name,
        SourceConfig::Local {
            path: path.to_path_buf(),
            pattern: ".csv".to_string(),
        },
    )
}

pub fn integration_with_source(name: &str, source: SourceConfig) -> Integration {
    Integration {
        id: Uuid::new_v4(),
        name: name.to_string(),
        enabled: true,
        source,
        column_overrides: Default::default(),
        default_currency: None,
        default_supplier: None,
        status: IntegrationStatus::Idle,
        last_sync: None,
        stats: IntegrationStats::default(),
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub state: Arc<MemorySyncStore>,
    pub documents: Arc<MemoryDocumentStore>,
    pub search: Arc<MemorySearchIndex>,
    pub probe: Arc<FixedProbe>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Build with in-memory stores after adjusting the fast defaults
    pub fn with_config(adjust: impl FnOnce(&mut SyncConfig)) -> Self {
        let search = Arc::new(MemorySearchIndex::new());
        Self::with_search(search.clone(), search, adjust)
    }

    /// Build around a caller-supplied search index; `memory_search` is what
    /// the harness exposes for assertions
    pub fn with_search(
        memory_search: Arc<MemorySearchIndex>,
        search: Arc<dyn SearchIndex>,
        adjust: impl FnOnce(&mut SyncConfig),
    ) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        std::fs::create_dir_all(dir.path().join("source")).expect("Failed to create source dir");

        let mut config = fast_config(&dir.path().join("cache"));
        adjust(&mut config);

        let state = Arc::new(MemorySyncStore::new());
        let documents = Arc::new(MemoryDocumentStore::new());
        let probe = Arc::new(FixedProbe::default());

        let orchestrator = Arc::new(SyncOrchestrator::new(
            config,
            SyncDependencies {
                state: state.clone(),
                documents: documents.clone(),
                search,
                memory_probe: probe.clone(),
            },
        ));

        Self {
            dir,
            state,
            documents,
            search: memory_search,
            probe,
            orchestrator,
        }
    }

    pub fn source_dir(&self) -> PathBuf {
        self.dir.path().join("source")
    }

    pub fn write_source(&self, name: &str, contents: &str) {
        std::fs::write(self.source_dir().join(name), contents).expect("Failed to write source file");
    }

    /// Save a local-directory integration reading the harness source dir
    pub async fn add_local_integration(&self, name: &str) -> Integration {
        let integration = local_integration(name, &self.source_dir());
        self.save(&integration).await;
        integration
    }

    pub async fn save(&self, integration: &Integration) {
        self.state
            .save_integration(integration)
            .await
            .expect("Failed to save integration");
    }

    /// Enqueue, claim and run one request for `integration_id`
    pub async fn sync(&self, integration_id: Uuid) -> SyncResult<RunHistory> {
        self.state.enqueue_request(integration_id).await?;
        let request = self
            .state
            .claim_next_request()
            .await?
            .expect("No pending request");
        self.orchestrator.run_request(&request, &CancellationToken::new()).await
    }
}
