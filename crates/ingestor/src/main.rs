//! chainsink-ingestor - bus-fed block ingestion for a UTXO chain
//!
//! This binary provides:
//! - The ingestion loop: decode, linkage check, atomic persistence
//! - Reorg and gap reconciliation against the upstream node
//! - Optional Omni/Tether overlay reconciliation and backfill
//! - A periodic gap sweep (cron worker)
//!
//! Block documents are read line-by-line from stdin, so any bus client that
//! can write NDJSON (e.g. `kafkacat -C -t btc_block`) works as the
//! transport.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use chainsink_ingestor::bus::{BusMessage, ChannelConsumer};
use chainsink_ingestor::config::Config;
use chainsink_ingestor::cron::CronWorker;
use chainsink_ingestor::ingest::Ingestor;
use chainsink_ingestor::metrics::PipelineStats;
use chainsink_ingestor::rpc::{NodeApi, NodeClient, OmniApi, OmniClient};
use chainsink_ingestor::storage::Storage;

#[derive(Parser)]
#[command(name = "chainsink-ingestor")]
#[command(version, about = "Block ingestion pipeline for a UTXO chain", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "ingestor.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline
    Run,

    /// Show store tip positions and row counts
    Status,

    /// Initialize the store schema
    InitDb {
        /// Database URL
        #[arg(long)]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_ingestor(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb { database_url } => init_database(&database_url).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("chainsink_ingestor=debug,sqlx=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("chainsink_ingestor=info"))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}

/// Wire the pipeline and run the ingestion loop until stdin closes.
async fn run_ingestor(config_path: &str) -> Result<()> {
    info!("chainsink ingestor starting, config: {}", config_path);
    info!("version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_file(config_path)?;

    let storage = Storage::connect(&config.database.url, config.database.max_connections).await?;
    storage.run_migrations().await?;

    PipelineStats::describe();
    let stats = Arc::new(PipelineStats::default());

    let node: Arc<dyn NodeApi> = Arc::new(NodeClient::new(
        &config.node.endpoint,
        &config.node.user,
        &config.node.password,
    ));
    let omni: Option<Arc<dyn OmniApi>> = if config.omni.enable {
        Some(Arc::new(OmniClient::new(
            &config.omni.endpoint,
            &config.omni.user,
            &config.omni.password,
        )))
    } else {
        None
    };

    let (gap_sender, gap_receiver) = mpsc::channel(1024);
    let mut cron = CronWorker::new(
        storage.clone(),
        Arc::clone(&node),
        config.node.max_batch_block,
        gap_sender,
    );
    cron.prepare().await?;

    let mut ingestor = Ingestor::new(
        &config,
        storage.clone(),
        node,
        omni,
        Arc::clone(&stats),
        gap_receiver,
    )?;

    let (bus_sender, mut consumer) = ChannelConsumer::pair(1024);
    let feeder = spawn_stdin_feeder(config.bus.topic.clone(), bus_sender);

    cron.start();
    info!(topic = %config.bus.topic, "consuming block documents from stdin");

    let result = ingestor.run(&mut consumer).await;

    cron.stop().await;
    feeder.abort();
    storage.close().await;

    let snapshot = stats.snapshot();
    info!(
        received = snapshot.receive_messages,
        committed = snapshot.database_commit,
        rolled_back = snapshot.database_rollback,
        "ingestor stopped"
    );

    result
}

/// Feed stdin lines onto the in-process bus, one message per line.
fn spawn_stdin_feeder(topic: String, sender: mpsc::Sender<BusMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut offset = 0i64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let message = BusMessage {
                        topic: topic.clone(),
                        partition: 0,
                        offset,
                        payload: line.into_bytes(),
                    };
                    offset += 1;
                    if sender.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("stdin read error: {}", e);
                    break;
                }
            }
        }
    })
}

/// Show store tip positions and row counts.
async fn show_status(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)?;

    let storage = Storage::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    storage.run_migrations().await?;

    let stats = storage.stats().await?;

    println!("\n=== chainsink store status ===\n");
    println!("Dialect: {:?}", storage.dialect());
    println!(
        "Tip height: {}",
        stats
            .tip_height
            .map(|h| h.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!(
        "Overlay height: {}",
        stats
            .max_omni_height
            .map(|h| h.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    println!("\nRow counts:");
    println!("  Blocks: {}", stats.block_count);
    println!("  Transactions: {}", stats.transaction_count);
    println!("  Overlay transactions: {}", stats.omni_transaction_count);
    println!("  Overlay addresses: {}", stats.tether_address_count);
    println!();

    storage.close().await;

    Ok(())
}

/// Initialize the store schema.
async fn init_database(database_url: &str) -> Result<()> {
    info!("initializing store: {}", database_url);

    let storage = Storage::connect(database_url, 1)
        .await
        .context("Failed to connect to database")?;

    storage.run_migrations().await?;
    storage
        .health_check()
        .await
        .context("Store health check failed")?;

    let stats = storage.stats().await?;
    info!("store initialized");
    info!("  blocks: {}", stats.block_count);
    info!("  transactions: {}", stats.transaction_count);
    info!("  overlay transactions: {}", stats.omni_transaction_count);

    storage.close().await;

    Ok(())
}
