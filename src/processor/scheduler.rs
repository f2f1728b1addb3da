use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{SymbolAvailabilityCache, UpdateCadenceState};
use crate::config::SchedulerSettings;
use crate::database::models::Candle;
use crate::database::store::{CandleStore, InstrumentRegistry, MarketStore};
use crate::error::{StoreError, SyncError};
use crate::indicators::DmaEngine;
use crate::processor::job::SyncPair;
use crate::processor::shutdown::ShutdownSignal;
use crate::processor::window::{compute_fetch_window_with, FetchWindow};
use crate::sources::{ChainOutcome, FetchRequest, SourceChain, SymbolLister};
use crate::timeframe::Timeframe;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub base_interval: Duration,
    pub inter_pair_delay: Duration,
    pub shutdown_timeout: Duration,
    pub symbol_cache_ttl: chrono::Duration,
    pub bootstrap_candles: usize,
    pub recompute_dma: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            inter_pair_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            symbol_cache_ttl: chrono::Duration::hours(1),
            bootstrap_candles: 100,
            recompute_dma: true,
        }
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            base_interval: Duration::from_secs(settings.base_interval_secs),
            inter_pair_delay: Duration::from_millis(settings.inter_pair_delay_ms),
            shutdown_timeout: Duration::from_secs(settings.shutdown_timeout_secs),
            symbol_cache_ttl: chrono::Duration::seconds(settings.symbol_cache_ttl_secs as i64),
            bootstrap_candles: settings.bootstrap_candles,
            recompute_dma: settings.recompute_dma,
        }
    }
}

/// What one synchronization attempt did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Symbol not in the availability snapshot; nothing fetched.
    Unavailable,
    UpToDate,
    /// Every source answered, none had rows.
    NoData,
    Synced {
        source: String,
        fetched: usize,
        stored: u64,
    },
}

impl SyncOutcome {
    pub fn new_rows(&self) -> u64 {
        match self {
            SyncOutcome::Synced { stored, .. } => *stored,
            _ => 0,
        }
    }

    fn touched_sources(&self) -> bool {
        matches!(self, SyncOutcome::NoData | SyncOutcome::Synced { .. })
    }
}

/// Counters for one pass over all pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub attempted: usize,
    pub synced: usize,
    pub up_to_date: usize,
    pub no_data: usize,
    pub unavailable: usize,
    pub failed: usize,
    pub skipped_not_due: usize,
    pub skipped_unknown: usize,
    pub new_rows: u64,
    pub interrupted: bool,
}

impl PassSummary {
    fn record(&mut self, result: &Result<SyncOutcome, SyncError>) {
        match result {
            Ok(SyncOutcome::Unavailable) => self.unavailable += 1,
            Ok(SyncOutcome::UpToDate) => self.up_to_date += 1,
            Ok(SyncOutcome::NoData) => self.no_data += 1,
            Ok(SyncOutcome::Synced { stored, .. }) => {
                self.synced += 1;
                self.new_rows += stored;
            }
            Err(_) => self.failed += 1,
        }
    }

    pub fn log(&self) {
        info!(
            "Sync pass finished: attempted={}, synced={}, up_to_date={}, no_data={}, unavailable={}, failed={}, not_due={}, unknown_timeframe={}, new_rows={}{}",
            self.attempted,
            self.synced,
            self.up_to_date,
            self.no_data,
            self.unavailable,
            self.failed,
            self.skipped_not_due,
            self.skipped_unknown,
            self.new_rows,
            if self.interrupted { " (interrupted)" } else { "" }
        );
    }
}

/// Keeps every (instrument, timeframe) candle series current.
///
/// Pairs are processed one at a time within a pass so external rate limits
/// are never hit by fan-out. Each timeframe is re-synced no more often than
/// its [`Timeframe::update_interval`], and failures stay local to their pair.
pub struct SyncScheduler {
    store: Arc<dyn MarketStore>,
    chain: SourceChain,
    lister: Option<Arc<dyn SymbolLister>>,
    symbols: SymbolAvailabilityCache,
    cadence: Mutex<UpdateCadenceState>,
    dma: Option<Arc<DmaEngine>>,
    config: SchedulerConfig,
}

impl SyncScheduler {
    pub fn new(store: Arc<dyn MarketStore>, chain: SourceChain, config: SchedulerConfig) -> Self {
        Self {
            store,
            chain,
            lister: None,
            symbols: SymbolAvailabilityCache::new(config.symbol_cache_ttl),
            cadence: Mutex::new(UpdateCadenceState::new()),
            dma: None,
            config,
        }
    }

    /// Skip symbols the lister does not report as tradable.
    pub fn with_symbol_lister(mut self, lister: Arc<dyn SymbolLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Recompute DMA metrics for pairs that received new candles.
    pub fn with_dma(mut self, engine: Arc<DmaEngine>) -> Self {
        self.dma = Some(engine);
        self
    }

    pub fn symbol_cache(&self) -> &SymbolAvailabilityCache {
        &self.symbols
    }

    pub fn cadence(&self) -> UpdateCadenceState {
        self.cadence.lock().clone()
    }

    /// Every pair with a resolvable timeframe, in processing order, plus the
    /// number of timeframe rows skipped for an unknown label.
    pub async fn pairs(&self) -> Result<(Vec<SyncPair>, usize), StoreError> {
        let instruments = self.store.instruments().await?;
        let records = self.store.timeframes().await?;

        let mut timeframes = Vec::with_capacity(records.len());
        let mut unknown = 0;
        for record in &records {
            match record.resolve() {
                Ok(tf) => timeframes.push((record.id, tf)),
                Err(e) => {
                    warn!("Skipping timeframe row {}: {}", record.id, e);
                    unknown += 1;
                }
            }
        }

        let mut pairs: Vec<SyncPair> = instruments
            .iter()
            .flat_map(|i| {
                timeframes
                    .iter()
                    .map(move |(id, tf)| SyncPair::new(i.clone(), *id, *tf))
            })
            .collect();
        pairs.sort();

        Ok((pairs, unknown))
    }

    pub async fn sync_one(&self, pair: &SyncPair) -> Result<SyncOutcome, SyncError> {
        self.sync_one_at(pair, Utc::now()).await
    }

    #[instrument(skip(self, pair), fields(symbol = %pair.instrument.symbol, timeframe = %pair.timeframe))]
    pub async fn sync_one_at(&self, pair: &SyncPair, now: DateTime<Utc>) -> Result<SyncOutcome, SyncError> {
        if let Some(lister) = &self.lister {
            if !self.symbols.is_available(lister.as_ref(), pair.symbol(), now).await {
                debug!("Symbol not available on exchange, skipping");
                return Ok(SyncOutcome::Unavailable);
            }
        }

        let last = self
            .store
            .last_candle_time(pair.instrument.id, pair.timeframe_id)
            .await?;

        let bootstrap = self.config.bootstrap_candles.max(1);
        let request = match compute_fetch_window_with(last, pair.timeframe, now, bootstrap as i32) {
            FetchWindow::UpToDate => {
                debug!("Already up to date");
                return Ok(SyncOutcome::UpToDate);
            }
            FetchWindow::Range { cold: true, .. } => FetchRequest::Recent { limit: bootstrap },
            FetchWindow::Range { start, end, .. } => FetchRequest::Range { start, end },
        };

        let (source, rows) = match self.chain.fetch(pair.symbol(), pair.timeframe, request).await {
            ChainOutcome::Hit { source, rows } => (source, rows),
            ChainOutcome::Exhausted { attempts, failed } if attempts > 0 && failed == attempts => {
                warn!("All {} sources failed, will retry next cadence", attempts);
                return Err(SyncError::AllSourcesFailed {
                    symbol: pair.symbol().to_string(),
                    timeframe: pair.timeframe.to_string(),
                    attempts,
                });
            }
            ChainOutcome::Exhausted { .. } => {
                debug!("No source returned rows");
                return Ok(SyncOutcome::NoData);
            }
        };

        let fetched = rows.len();
        // Sources may include the boundary candle we already have
        let fresh: Vec<Candle> = rows
            .into_iter()
            .filter(|c| last.map_or(true, |l| c.candle_time > l))
            .collect();

        let stored = if fresh.is_empty() {
            0
        } else {
            self.store
                .upsert_candles(pair.instrument.id, pair.timeframe_id, &fresh)
                .await?
        };

        debug!(source = %source, fetched, stored, "Pair synchronized");
        Ok(SyncOutcome::Synced {
            source,
            fetched,
            stored,
        })
    }

    /// Synchronize a single pair by symbol, creating the instrument if needed.
    pub async fn sync_pair(&self, symbol: &str, timeframe: Timeframe) -> Result<SyncOutcome, SyncError> {
        let instrument = self.store.ensure_instrument(symbol).await?;
        let record = self
            .store
            .timeframes()
            .await?
            .into_iter()
            .find(|r| r.resolve().ok() == Some(timeframe))
            .ok_or_else(|| SyncError::UnknownTimeframe(timeframe.to_string()))?;

        let pair = SyncPair::new(instrument, record.id, timeframe);
        let outcome = self.sync_one(&pair).await?;
        self.cadence.lock().record(timeframe, Utc::now());
        self.refresh_dma(&pair, &outcome).await;
        Ok(outcome)
    }

    /// One pass over all pairs; `force_all` ignores cadence.
    pub async fn tick(&self, force_all: bool) -> PassSummary {
        self.tick_at(force_all, Utc::now(), &mut ShutdownSignal::never()).await
    }

    #[instrument(skip(self, shutdown))]
    pub async fn tick_at(&self, force_all: bool, now: DateTime<Utc>, shutdown: &mut ShutdownSignal) -> PassSummary {
        let mut summary = PassSummary::default();

        let (pairs, unknown) = match self.pairs().await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to load instruments and timeframes: {}", e);
                summary.failed += 1;
                return summary;
            }
        };
        summary.skipped_unknown = unknown;

        // Decided once so every instrument of a due timeframe gets its turn this pass
        let due: HashSet<Timeframe> = {
            let cadence = self.cadence.lock();
            pairs
                .iter()
                .map(|p| p.timeframe)
                .filter(|tf| force_all || cadence.should_sync(*tf, now))
                .collect()
        };

        if due.is_empty() {
            debug!("No timeframe due");
            summary.skipped_not_due = pairs.len();
            return summary;
        }

        if let Some(lister) = &self.lister {
            self.symbols.ensure_fresh(lister.as_ref(), now).await;
        }

        for pair in &pairs {
            if shutdown.is_stopped() {
                summary.interrupted = true;
                break;
            }

            if !due.contains(&pair.timeframe) {
                summary.skipped_not_due += 1;
                continue;
            }

            summary.attempted += 1;
            let result = self.sync_one_at(pair, now).await;
            // A failed attempt still consumes the turn
            self.cadence.lock().record(pair.timeframe, now);

            match &result {
                Ok(outcome) => self.refresh_dma(pair, outcome).await,
                Err(SyncError::Store(e)) => error!("Store failure for {}: {}", pair, e),
                Err(e) => warn!("Sync failed for {}: {}", pair, e),
            }
            summary.record(&result);

            let touched = match &result {
                Ok(outcome) => outcome.touched_sources(),
                Err(_) => true,
            };
            if touched && shutdown.sleep(self.config.inter_pair_delay).await {
                summary.interrupted = true;
                break;
            }
        }

        summary
    }

    async fn refresh_dma(&self, pair: &SyncPair, outcome: &SyncOutcome) {
        let Some(engine) = &self.dma else {
            return;
        };
        if !self.config.recompute_dma || outcome.new_rows() == 0 {
            return;
        }

        match engine.refresh_pair(pair.instrument.id, pair.timeframe_id).await {
            Ok(report) => debug!("Refreshed {} DMA series for {}", report.series, pair),
            Err(e) => warn!("DMA refresh failed for {}: {}", pair, e),
        }
    }

    /// Loop passes until `shutdown` is raised. The first pass ignores cadence.
    pub async fn run(self: Arc<Self>, mut shutdown: ShutdownSignal) {
        info!(
            "Sync scheduler started (interval {:?}, sources {:?})",
            self.config.base_interval,
            self.chain.names()
        );

        let mut first = true;
        while !shutdown.is_stopped() {
            let summary = self.tick_at(first, Utc::now(), &mut shutdown).await;
            summary.log();
            first = false;

            if shutdown.sleep(self.config.base_interval).await {
                break;
            }
        }

        info!("Sync scheduler stopped");
    }

    /// Run on a background task.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (stop_tx, signal) = ShutdownSignal::channel();
        let shutdown_timeout = self.config.shutdown_timeout;
        let join = tokio::spawn(self.run(signal));
        SchedulerHandle {
            stop_tx,
            join,
            shutdown_timeout,
        }
    }
}

pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl SchedulerHandle {
    /// Raise the stop flag and wait for the loop to finish. Returns false if
    /// it did not quiesce within the shutdown timeout and had to be aborted.
    pub async fn stop(self) -> bool {
        let _ = self.stop_tx.send(true);
        let abort = self.join.abort_handle();

        match tokio::time::timeout(self.shutdown_timeout, self.join).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Scheduler task ended abnormally: {}", e);
                true
            }
            Err(_) => {
                warn!(
                    "Scheduler did not stop within {:?}, aborting",
                    self.shutdown_timeout
                );
                abort.abort();
                false
            }
        }
    }
}
