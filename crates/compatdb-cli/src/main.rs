use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use compatdb_core::ReportVersion;
use compatdb_storage::{DocumentStore, MemoryStore, PgDocumentStore};
use compatdb_sync::{
    format_days, time_remaining, CycleOutcome, CycleReport, Scheduler, SyncConfig, SyncPipeline,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "compatdb")]
#[command(about = "Compatibility report ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the background ingestion scheduler until interrupted.
    Run,
    /// Run a single ingestion cycle and exit.
    SyncOnce {
        /// Use an in-memory store instead of Postgres.
        #[arg(long)]
        memory: bool,
    },
    /// Create tables and indexes.
    Migrate,
    /// Print checkpoint, counts and time to the next cycle.
    Status,
}

fn ensure_dotenv() {
    if dotenv::dotenv().is_ok() {
        return;
    }
    let candidate = format!("{}/.env", env!("CARGO_MANIFEST_DIR"));
    let _ = dotenv::from_filename(candidate);
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

async fn connect(config: &SyncConfig) -> Result<PgDocumentStore> {
    let store = PgDocumentStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("ensuring schema")?;
    Ok(store)
}

async fn run(config: SyncConfig) -> Result<()> {
    if config.update_interval.is_zero() {
        info!("COMPATDB_UPDATE_INTERVAL_SECS is 0; nothing to run");
        return Ok(());
    }

    let store: Arc<dyn DocumentStore> = Arc::new(connect(&config).await?);
    let pipeline = Arc::new(SyncPipeline::from_config(&config, store)?);

    let (results_tx, mut results_rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(pipeline, config.update_interval, config.cycle_backoff)
        .with_results(results_tx);
    let mut scheduler_task = tokio::spawn(scheduler.run(shutdown_rx));

    loop {
        tokio::select! {
            Some(report) = results_rx.recv() => match report {
                CycleReport::Completed(CycleOutcome::Advanced(summary)) => {
                    let summary = serde_json::to_string(&summary).context("encoding summary")?;
                    info!(%summary, "ingested archive");
                }
                CycleReport::Completed(CycleOutcome::Unchanged) => {}
                CycleReport::Failed { attempts, error } => {
                    error!(attempts, error = %error, "ingestion cycle failed");
                }
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for ctrl-c")?;
                info!("shutdown requested");
                let _ = shutdown_tx.send(true);
                break;
            }
            joined = &mut scheduler_task => {
                return joined.context("scheduler task panicked")?.context("scheduler stopped");
            }
        }
    }

    scheduler_task
        .await
        .context("scheduler task panicked")?
        .context("scheduler stopped")
}

async fn sync_once(config: SyncConfig, memory: bool) -> Result<()> {
    let store: Arc<dyn DocumentStore> = if memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect(&config).await?)
    };
    let pipeline = SyncPipeline::from_config(&config, store)?;
    let mut checkpoint = pipeline.load_checkpoint().await?;
    match pipeline.run_cycle(&mut checkpoint).await? {
        CycleOutcome::Advanced(summary) => println!(
            "sync complete: archive={} version={} records={} inserted={} duplicates={} rejected={}",
            summary.archive,
            summary.version,
            summary.records,
            summary.inserted,
            summary.duplicates,
            summary.rejected
        ),
        CycleOutcome::Unchanged => println!(
            "sync complete: already at {}",
            checkpoint.last_processed_file
        ),
    }
    Ok(())
}

async fn status(config: SyncConfig) -> Result<()> {
    let store = PgDocumentStore::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    let Some(checkpoint) = store.load_checkpoint().await? else {
        println!("no checkpoint yet");
        return Ok(());
    };

    let last_tick = checkpoint
        .last_checked_time
        .unwrap_or(checkpoint.last_processed_time);
    let remaining = if config.update_interval.is_zero() {
        None
    } else {
        time_remaining(last_tick, config.update_interval, chrono::Utc::now())
    };

    println!("last processed file: {}", checkpoint.last_processed_file);
    println!("last processed time: {}", checkpoint.last_processed_time);
    println!("games: {}", store.count_games().await?);
    println!("reports: {}", store.count_reports(None).await?);
    println!("  V1: {}", store.count_reports(Some(ReportVersion::V1)).await?);
    println!("  V2: {}", store.count_reports(Some(ReportVersion::V2)).await?);
    println!("time to next update: {}", format_days(remaining));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    ensure_dotenv();
    init_tracing("info")?;
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::SyncOnce { memory } => sync_once(config, memory).await,
        Commands::Migrate => {
            connect(&config).await?;
            println!("schema ready");
            Ok(())
        }
        Commands::Status => status(config).await,
    }
}
