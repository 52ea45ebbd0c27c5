//! Stockflow Sync - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;
use stockflow_common::logging::{init_logging, LogConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use uuid::Uuid;

use stockflow_sync::{
    db,
    models::Integration,
    resilience::SysinfoProbe,
    state::{PgSyncStore, SyncStore},
    store::{DocumentStore, ElasticsearchIndex, PgDocumentStore, SearchIndex},
    transform::{transform_directory, TransformOptions},
    SyncConfig, SyncDependencies, SyncOrchestrator, SyncWorker,
};

#[derive(Parser, Debug)]
#[command(name = "stockflow-sync")]
#[command(author, version, about = "Supplier inventory ingestion into Postgres and Elasticsearch", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Debug-level console logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply database migrations
    Migrate,

    /// Manage integrations
    Integration {
        #[command(subcommand)]
        command: IntegrationCommand,
    },

    /// Queue a sync run for an integration
    Enqueue {
        #[arg(long)]
        integration: Uuid,
    },

    /// Run the sync worker until interrupted
    Worker,

    /// Delete every part of an integration from both stores
    Purge {
        #[arg(long)]
        integration: Uuid,
    },

    /// Print the progress (live) or history (finished) of a run as JSON
    Status {
        #[arg(long)]
        run: Uuid,
    },

    /// Print the most recent runs of an integration as JSON
    History {
        #[arg(long)]
        integration: Uuid,

        #[arg(long, default_value_t = 10)]
        limit: u32,
    },

    /// Convert a directory of CSV exports to NDJSON documents and bulk bodies
    Transform {
        /// Directory holding `.csv` / `.csv.gz` exports
        input: PathBuf,

        /// Output directory, created if missing
        output: PathBuf,

        #[arg(long)]
        integration_id: Option<Uuid>,

        #[arg(long, default_value = "offline")]
        integration_name: String,

        /// Target index named in the bulk action lines
        #[arg(long)]
        index: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum IntegrationCommand {
    /// Create or replace an integration from a JSON file
    Add {
        #[arg(long)]
        file: PathBuf,
    },

    /// Print an integration as JSON
    Show { id: Uuid },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .log_file_prefix("stockflow-sync")
        .filter_directives("sqlx=warn,reqwest=info,hyper_util=info")
        .build();
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    let config = SyncConfig::from_env().context("Invalid configuration")?;
    execute_command(cli.command, config).await
}

async fn execute_command(command: Commands, config: SyncConfig) -> Result<()> {
    match command {
        Commands::Migrate => {
            let pool = connect(&config).await?;
            db::run_migrations(&pool).await?;
            info!("Database migrations completed");
            Ok(())
        },

        Commands::Integration { command } => {
            let state = PgSyncStore::new(connect(&config).await?);
            match command {
                IntegrationCommand::Add { file } => {
                    let raw = tokio::fs::read_to_string(&file)
                        .await
                        .with_context(|| format!("Failed to read {}", file.display()))?;
                    let integration: Integration = serde_json::from_str(&raw)
                        .with_context(|| format!("Invalid integration in {}", file.display()))?;
                    state.save_integration(&integration).await?;
                    info!(integration_id = %integration.id, name = %integration.name, "Integration saved");
                    println!("{}", integration.id);
                },
                IntegrationCommand::Show { id } => {
                    let integration = state
                        .get_integration(id)
                        .await?
                        .with_context(|| format!("Integration {} not found", id))?;
                    print_json(&integration)?;
                },
            }
            Ok(())
        },

        Commands::Enqueue { integration } => {
            let state = PgSyncStore::new(connect(&config).await?);
            state
                .get_integration(integration)
                .await?
                .with_context(|| format!("Integration {} not found", integration))?;
            let request = state.enqueue_request(integration).await?;
            info!(request_id = %request.id, integration_id = %integration, "Sync request queued");
            println!("{}", request.id);
            Ok(())
        },

        Commands::Worker => run_worker(config).await,

        Commands::Purge { integration } => {
            let pool = connect(&config).await?;
            let documents = PgDocumentStore::new(pool);
            let search = ElasticsearchIndex::new(&config.search)?;

            let deleted_documents = documents.delete_by_integration(integration).await?;
            let deleted_search = search.delete_by_integration(integration).await?;
            info!(
                integration_id = %integration,
                documents = deleted_documents,
                search = deleted_search,
                "Purged integration parts"
            );
            Ok(())
        },

        Commands::Status { run } => {
            let state = PgSyncStore::new(connect(&config).await?);
            if let Some(progress) = state.get_progress(run).await? {
                return print_json(&progress);
            }
            let history = state
                .get_history(run)
                .await?
                .with_context(|| format!("No progress or history for run {}", run))?;
            print_json(&history)
        },

        Commands::History { integration, limit } => {
            let state = PgSyncStore::new(connect(&config).await?);
            let runs = state.list_history(integration, limit).await?;
            print_json(&runs)
        },

        Commands::Transform {
            input,
            output,
            integration_id,
            integration_name,
            index,
        } => {
            let options = TransformOptions {
                integration_id: integration_id.unwrap_or_else(Uuid::nil),
                integration_name,
                index: index.unwrap_or_else(|| config.search.index.clone()),
                default_currency: config.worker.default_currency.clone(),
                low_stock_threshold: config.worker.low_stock_threshold,
                ..TransformOptions::default()
            };
            let summary = transform_directory(&input, &output, &options).await?;
            print_json(&summary)?;
            if summary.failed_files > 0 {
                anyhow::bail!("{} file(s) failed to transform", summary.failed_files);
            }
            Ok(())
        },
    }
}

async fn run_worker(config: SyncConfig) -> Result<()> {
    let pool = connect(&config).await?;
    db::run_migrations(&pool).await?;

    let documents: Arc<dyn DocumentStore> = Arc::new(PgDocumentStore::new(pool.clone()));
    let search: Arc<dyn SearchIndex> = Arc::new(ElasticsearchIndex::new(&config.search)?);
    let deps = SyncDependencies {
        state: Arc::new(PgSyncStore::new(pool)),
        documents,
        search,
        memory_probe: Arc::new(SysinfoProbe::new()?),
    };

    tokio::fs::create_dir_all(&config.worker.cache_dir)
        .await
        .with_context(|| format!("Failed to create cache directory {}", config.worker.cache_dir.display()))?;

    let orchestrator = Arc::new(SyncOrchestrator::new(config, deps));
    let worker = SyncWorker::new(orchestrator);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, finishing the current batch"),
            Err(e) => {
                warn!(error = %e, "Failed to listen for shutdown signal");
                return;
            },
        }
        shutdown.cancel();
    });

    worker.run(cancel).await;
    Ok(())
}

async fn connect(config: &SyncConfig) -> Result<PgPool> {
    let url = config.database.require_url()?;
    let pool = db::create_pool(url, &config.database).await?;
    db::health_check(&pool).await.context("Database health check failed")?;
    Ok(pool)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
