//! Ledger Reconciler Daemon
//!
//! Periodically reads ledger entries, fetches their content from a Kubo node
//! and tracks the entries that could not be resolved.
//!
//! ## Usage
//!
//! ```bash
//! # Run the sync loop against a ledger export
//! ledger-reconciler --ledger-file ./ledger.json run
//!
//! # Single pass, print summaries
//! ledger-reconciler --ledger-file ./ledger.json once
//!
//! # Inspect the retry ledger
//! ledger-reconciler ignored
//! ledger-reconciler due
//!
//! # Provenance of one id (cache first, then ledger)
//! ledger-reconciler --ledger-file ./ledger.json meta QmHash
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use ledger_reconciler::store::open_database;
use ledger_reconciler::{
    ChainClient, Config, JsonLedgerFile, KuboClient, MetadataCache, Reconciler, RetryLedger,
    SledStore, SyncService, SystemClock,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const RETRY_LEDGER_TREE: &str = "ignored";
const METADATA_TREE: &str = "metadata";
const CURSOR_TREE: &str = "cursor";

#[derive(Parser, Debug)]
#[command(name = "ledger-reconciler")]
#[command(about = "Reconciles on-chain content pointers with IPFS")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Kubo RPC API URL
    #[arg(long, env = "IPFS_URL")]
    ipfs_url: Option<String>,

    /// JSON export of ledger entries
    #[arg(long, env = "LEDGER_FILE")]
    ledger_file: Option<PathBuf>,

    /// Maximum concurrent IPFS reads
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the sync loop until Ctrl+C
    Run,

    /// Run a single sync pass
    Once,

    /// Dump the retry ledger
    Ignored,

    /// List entries due for retry
    Due,

    /// Show provenance of a content id
    Meta {
        /// Content id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("ledger_reconciler=info".parse()?);
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(url) = args.ipfs_url {
        config.ipfs_url = url;
    }
    if let Some(path) = args.ledger_file {
        config.ledger_file = Some(path);
    }
    if let Some(concurrency) = args.max_concurrency {
        config.max_concurrency = concurrency;
    }

    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .with_context(|| format!("failed to create {}", config.storage_dir.display()))?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let db = open_database(config.db_path())?;
    let ledger = Arc::new(RetryLedger::new(
        Arc::new(SledStore::open_tree(&db, RETRY_LEDGER_TREE)?),
        Arc::new(SystemClock),
        config.backoff_policy(),
    ));

    match args.command {
        Command::Ignored => print_json(&ledger.data_ids_with_reasons()?)?,
        Command::Due => {
            for entry in ledger.data_ids_to_retry()? {
                println!("{}", entry.hash);
            }
        }
        Command::Meta { id } => {
            let metadata = MetadataCache::new(
                Arc::new(SledStore::open_tree(&db, METADATA_TREE)?),
                chain_client(&config, &db)?,
            );
            print_json(&metadata.get_data_id_meta(&id).await?)?;
        }
        Command::Once => {
            let service = build_service(&config, &db, ledger).await?;
            let report = service.tick().await?;
            print_json(&report)?;
        }
        Command::Run => {
            let mut service = build_service(&config, &db, ledger).await?
                .with_interval(config.sync_interval());

            let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
            service.set_shutdown(shutdown_rx);

            let handle = tokio::spawn(async move {
                if let Err(e) = service.run().await {
                    error!(error = %e, "Sync service failed");
                }
            });

            info!("Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");

            let _ = shutdown_tx.send(());
            let _ = handle.await;
        }
    }

    db.flush().context("failed to flush state database")?;
    Ok(())
}

fn chain_client(config: &Config, db: &sled::Db) -> anyhow::Result<Arc<dyn ChainClient>> {
    let path = config
        .ledger_file
        .as_ref()
        .context("no ledger source configured (set --ledger-file or ledger_file)")?;
    let cursor_store = Arc::new(SledStore::open_tree(db, CURSOR_TREE)?);
    Ok(Arc::new(JsonLedgerFile::with_cursor_store(path, cursor_store)?))
}

async fn build_service(
    config: &Config,
    db: &sled::Db,
    ledger: Arc<RetryLedger>,
) -> anyhow::Result<SyncService> {
    let chain = chain_client(config, db)?;
    let metadata = Arc::new(MetadataCache::new(
        Arc::new(SledStore::open_tree(db, METADATA_TREE)?),
        Arc::clone(&chain),
    ));

    let kubo = KuboClient::new(config.kubo_config())?;
    if !kubo.is_available().await {
        warn!(ipfs_url = %config.ipfs_url, "IPFS node not reachable, fetches will be retried later");
    }
    let reconciler = Arc::new(
        Reconciler::new(Arc::new(kubo), ledger, Arc::new(SystemClock))
            .with_fetch_timeout(config.fetch_timeout()),
    );

    info!(
        ipfs_url = %config.ipfs_url,
        concurrency = config.max_concurrency,
        retries = config.max_in_pass_retries,
        "Reconciler ready"
    );
    if config.max_concurrency == 0 {
        warn!("max_concurrency is 0, using 1");
    }

    Ok(SyncService::new(chain, reconciler, metadata, config.reconcile_options()))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
