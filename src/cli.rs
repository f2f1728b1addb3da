// src/cli.rs
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::config::Settings;
use crate::database::store::{InstrumentRegistry, MarketStore};
use crate::database::PostgresManager;
use crate::error::SyncError;
use crate::indicators::DmaEngine;
use crate::processor::{
    BackfillJob, BackfillWorker, ChainFactory, SchedulerConfig, ShutdownSignal, SyncPair, SyncScheduler,
};
use crate::timeframe::Timeframe;
use crate::utils::{format_time, measure_time};

#[derive(Parser)]
#[command(name = "candle-sync")]
#[command(about = "Gap-aware candle synchronizer and DMA calculator", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to ./candle-sync.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the synchronization scheduler in the foreground
    Run,

    /// Start the scheduler
    Start {
        /// Run as a background daemon
        #[arg(short, long)]
        detached: bool,
    },

    /// Stop the background daemon
    Stop,

    /// Show daemon status
    Status,

    /// Create tables and seed timeframes
    InitDb,

    /// Register instruments to synchronize
    AddInstrument {
        /// Symbols (e.g., "BTCUSDT")
        #[arg(required = true)]
        symbols: Vec<String>,
    },

    /// Run one forced synchronization pass, or sync a single symbol
    Sync {
        /// Symbol (e.g., "BTCUSDT")
        #[arg(short, long)]
        symbol: Option<String>,

        /// Timeframe (e.g., "1h", "4h", "1d"); requires --symbol
        #[arg(short, long, requires = "symbol")]
        timeframe: Option<Timeframe>,
    },

    /// Backfill historical candles across a worker pool
    Backfill {
        /// Days of history to cover
        #[arg(long)]
        days: Option<i64>,

        /// Number of concurrent workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Restrict to these symbols
        #[arg(short, long)]
        symbol: Vec<String>,

        /// Restrict to these timeframes
        #[arg(short, long)]
        timeframe: Vec<Timeframe>,
    },

    /// Displaced moving average commands
    Dma {
        #[command(subcommand)]
        command: DmaCommands,
    },
}

#[derive(Subcommand)]
pub enum DmaCommands {
    /// Recompute DMA series (all pairs unless a pair is given)
    Compute {
        /// Symbol (e.g., "BTCUSDT")
        #[arg(short, long, requires = "timeframe")]
        symbol: Option<String>,

        /// Timeframe (e.g., "1h")
        #[arg(short, long, requires = "symbol")]
        timeframe: Option<Timeframe>,
    },

    /// Print a stored DMA series
    Show {
        #[arg(short, long)]
        symbol: String,

        #[arg(short, long)]
        timeframe: Timeframe,

        #[arg(short, long, default_value = "3")]
        window: usize,

        #[arg(short, long, default_value = "3")]
        displacement: usize,

        /// Number of most recent points to print
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Connect to PostgreSQL using the database settings
pub async fn connect_store(settings: &Settings) -> Result<Arc<PostgresManager>> {
    let db = &settings.database;
    let pg = PostgresManager::new(
        &db.host,
        db.port,
        &db.user,
        &db.password,
        &db.dbname,
        db.max_connections,
    )
    .await?;
    Ok(Arc::new(pg))
}

pub fn build_dma_engine(settings: &Settings, store: Arc<dyn MarketStore>) -> DmaEngine {
    DmaEngine::new(store, settings.dma.pairs.clone()).with_batch_size(settings.dma.bulk_batch_size)
}

/// Scheduler wired with the configured source chain, symbol lister and DMA engine.
pub fn build_scheduler(settings: &Settings, store: Arc<dyn MarketStore>) -> Result<SyncScheduler> {
    let chain = settings.sources.build_chain()?;
    let dma = Arc::new(build_dma_engine(settings, store.clone()));

    let mut scheduler =
        SyncScheduler::new(store, chain, SchedulerConfig::from(&settings.scheduler)).with_dma(dma);
    if let Some(lister) = settings.sources.build_lister()? {
        scheduler = scheduler.with_symbol_lister(Arc::new(lister));
    }
    Ok(scheduler)
}

/// Find an existing pair by symbol and timeframe.
pub async fn resolve_pair(store: &dyn MarketStore, symbol: &str, timeframe: Timeframe) -> Result<SyncPair> {
    let instrument = store
        .instruments()
        .await?
        .into_iter()
        .find(|i| i.symbol == symbol)
        .ok_or_else(|| SyncError::UnknownSymbol(symbol.to_string()))?;

    let record = store
        .timeframes()
        .await?
        .into_iter()
        .find(|r| r.resolve().ok() == Some(timeframe))
        .ok_or_else(|| SyncError::UnknownTimeframe(timeframe.to_string()))?;

    Ok(SyncPair::new(instrument, record.id, timeframe))
}

/// Run the scheduler until Ctrl-C or SIGTERM
pub async fn run_foreground(settings: &Settings) -> Result<()> {
    let store = connect_store(settings).await?;
    let scheduler = Arc::new(build_scheduler(settings, store)?);
    let handle = scheduler.spawn();

    wait_for_termination().await?;
    info!("Shutdown requested");

    if !handle.stop().await {
        info!("Scheduler was aborted after the shutdown timeout");
    }
    Ok(())
}

async fn wait_for_termination() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("Failed to listen for Ctrl-C")?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    }

    Ok(())
}

/// Execute a command that talks to the database
pub async fn execute_command(command: Commands, settings: &Settings) -> Result<()> {
    let store = connect_store(settings).await?;

    match command {
        Commands::InitDb => {
            store.init_tables().await?;
            println!("Database initialized.");
        }

        Commands::AddInstrument { symbols } => {
            for symbol in symbols {
                let instrument = store.ensure_instrument(&symbol.to_uppercase()).await?;
                println!("{:<6} {}", instrument.id, instrument.symbol);
            }
        }

        Commands::Sync { symbol, timeframe } => {
            let scheduler = build_scheduler(settings, store.clone())?;
            match (symbol, timeframe) {
                (Some(symbol), Some(timeframe)) => {
                    let outcome = scheduler.sync_pair(&symbol.to_uppercase(), timeframe).await?;
                    println!("{} {}: {:?}", symbol, timeframe, outcome);
                }
                (Some(symbol), None) => {
                    let symbol = symbol.to_uppercase();
                    store.ensure_instrument(&symbol).await?;
                    let (pairs, _) = scheduler.pairs().await?;
                    for pair in pairs.iter().filter(|p| p.symbol() == symbol) {
                        match scheduler.sync_pair(&symbol, pair.timeframe).await {
                            Ok(outcome) => println!("{}: {:?}", pair, outcome),
                            Err(e) => println!("{}: failed ({})", pair, e),
                        }
                    }
                }
                _ => {
                    let summary = measure_time("Forced sync pass", async { Ok(scheduler.tick(true).await) }).await?;
                    summary.log();
                    println!(
                        "Attempted {} pairs: {} synced, {} up to date, {} failed, {} new candles",
                        summary.attempted, summary.synced, summary.up_to_date, summary.failed, summary.new_rows
                    );
                }
            }
        }

        Commands::Backfill {
            days,
            concurrency,
            symbol,
            timeframe,
        } => {
            let days = days.unwrap_or(settings.backfill.days);
            let concurrency = concurrency.unwrap_or(settings.backfill.concurrency);
            let symbols: Vec<String> = symbol.iter().map(|s| s.to_uppercase()).collect();

            let scheduler = build_scheduler(settings, store.clone())?;
            let (pairs, _) = scheduler.pairs().await?;
            let jobs: Vec<BackfillJob> = pairs
                .into_iter()
                .filter(|p| symbols.is_empty() || symbols.iter().any(|s| s == p.symbol()))
                .filter(|p| timeframe.is_empty() || timeframe.contains(&p.timeframe))
                .map(|p| BackfillJob::new(p, days))
                .collect();

            let sources = settings.sources.clone();
            // Validate once so the factory below cannot fail
            sources.build_chain()?;
            let factory: ChainFactory = Arc::new(move || sources.build_chain().unwrap_or_default());

            let (stop_tx, signal) = ShutdownSignal::channel();
            let worker = BackfillWorker::new(store.clone(), factory, concurrency);
            let run = worker.run(jobs, signal);
            tokio::pin!(run);

            let report = tokio::select! {
                report = &mut run => report,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, waiting for in-flight jobs");
                    let _ = stop_tx.send(true);
                    run.await
                }
            };

            println!(
                "Backfill: {} jobs, {} completed, {} failed, {} new candles{}",
                report.jobs,
                report.completed,
                report.failed,
                report.new_rows,
                if report.interrupted { " (interrupted)" } else { "" }
            );
        }

        Commands::Dma { command } => match command {
            DmaCommands::Compute {
                symbol: Some(symbol),
                timeframe: Some(timeframe),
            } => {
                let engine = build_dma_engine(settings, store.clone());
                let pair = resolve_pair(store.as_ref(), &symbol.to_uppercase(), timeframe).await?;
                let report = engine.refresh_pair(pair.instrument.id, pair.timeframe_id).await?;
                println!("{}: {} series, {} points", pair, report.series, report.points);
            }
            DmaCommands::Compute { .. } => {
                let engine = build_dma_engine(settings, store.clone());
                let report = engine.recompute_all().await?;
                println!(
                    "Recomputed {} pairs ({} failed), {} points",
                    report.pairs, report.failed, report.points
                );
            }
            DmaCommands::Show {
                symbol,
                timeframe,
                window,
                displacement,
                limit,
            } => {
                let engine = build_dma_engine(settings, store.clone());
                let pair = resolve_pair(store.as_ref(), &symbol.to_uppercase(), timeframe).await?;
                let series = engine
                    .retrieve(pair.instrument.id, pair.timeframe_id, window, displacement)
                    .await?;

                if series.is_empty() {
                    println!("No DMA {}x{} computed yet for {}.", window, displacement, pair);
                } else {
                    println!("DMA {}x{} for {} ({} points):", window, displacement, pair, series.len());
                    println!("{:<24} | {:>16}", "Time", "Value");
                    println!("{:-<24}-+-{:->16}", "", "");
                    for point in series.iter().skip(series.len().saturating_sub(limit)) {
                        println!("{:<24} | {:>16.8}", format_time(&point.metric_timestamp), point.value);
                    }
                }
            }
        },

        Commands::Run | Commands::Start { .. } | Commands::Stop | Commands::Status => {
            anyhow::bail!("process management commands are handled by the binary");
        }
    }

    info!("Command finished at {}", format_time(&Utc::now()));
    Ok(())
}
