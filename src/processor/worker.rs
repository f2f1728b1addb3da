use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::database::models::Candle;
use crate::database::store::{CandleStore, MarketStore};
use crate::error::SyncError;
use crate::processor::job::BackfillJob;
use crate::processor::shutdown::ShutdownSignal;
use crate::processor::window::max_lookback;
use crate::sources::{ChainOutcome, FetchRequest, SourceChain};

/// Builds a fresh source chain for each worker.
pub type ChainFactory = Arc<dyn Fn() -> SourceChain + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub jobs: usize,
    pub completed: usize,
    pub failed: usize,
    pub new_rows: u64,
    pub interrupted: bool,
}

impl BackfillReport {
    fn merge(&mut self, other: BackfillReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.new_rows += other.new_rows;
        self.interrupted |= other.interrupted;
    }
}

/// Bulk historical backfill over a bounded pool of worker tasks.
///
/// Workers share nothing but the store; each one owns its own source chain.
pub struct BackfillWorker {
    store: Arc<dyn MarketStore>,
    chain_factory: ChainFactory,
    concurrency_limit: usize,
}

impl BackfillWorker {
    pub fn new(store: Arc<dyn MarketStore>, chain_factory: ChainFactory, concurrency_limit: usize) -> Self {
        Self {
            store,
            chain_factory,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    pub async fn run(&self, jobs: Vec<BackfillJob>, shutdown: ShutdownSignal) -> BackfillReport {
        let total = jobs.len();
        info!(
            "Starting backfill of {} pairs with concurrency limit: {}",
            total, self.concurrency_limit
        );

        // Set up the job queue
        let (job_tx, job_rx) = mpsc::channel(total.max(1));
        for job in jobs {
            if job_tx.send(job).await.is_err() {
                break;
            }
        }
        drop(job_tx);
        let job_rx = Arc::new(Mutex::new(job_rx));

        let workers = (0..self.concurrency_limit.min(total.max(1))).map(|worker_id| {
            let store = self.store.clone();
            let chain = (self.chain_factory)();
            let job_rx = job_rx.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(job_consumer(worker_id, store, chain, job_rx, shutdown))
        });

        let mut report = BackfillReport {
            jobs: total,
            ..Default::default()
        };
        for joined in join_all(workers).await {
            match joined {
                Ok(worker_report) => report.merge(worker_report),
                Err(e) => error!("Backfill worker panicked: {}", e),
            }
        }

        info!(
            "Backfill finished: jobs={}, completed={}, failed={}, new_rows={}",
            report.jobs, report.completed, report.failed, report.new_rows
        );
        report
    }
}

async fn job_consumer(
    worker_id: usize,
    store: Arc<dyn MarketStore>,
    chain: SourceChain,
    job_rx: Arc<Mutex<mpsc::Receiver<BackfillJob>>>,
    shutdown: ShutdownSignal,
) -> BackfillReport {
    let mut report = BackfillReport::default();

    loop {
        if shutdown.is_stopped() {
            report.interrupted = true;
            break;
        }

        let job = job_rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        info!("Worker {} processing job: {}", worker_id, job.pair);
        match backfill_one(store.as_ref(), &chain, &job, Utc::now(), &shutdown).await {
            Ok(rows) => {
                report.completed += 1;
                report.new_rows += rows;
            }
            Err(e) => {
                warn!("Backfill of {} failed: {}", job.pair, e);
                report.failed += 1;
            }
        }
    }

    debug!("Worker {} finished", worker_id);
    report
}

/// Walk one pair from `max(now - days, next candle open after last)` up to `now` in
/// chunks no longer than the timeframe's max lookback.
#[instrument(skip(store, chain, shutdown), fields(pair = %job.pair))]
pub async fn backfill_one(
    store: &dyn MarketStore,
    chain: &SourceChain,
    job: &BackfillJob,
    now: DateTime<Utc>,
    shutdown: &ShutdownSignal,
) -> Result<u64, SyncError> {
    let pair = &job.pair;
    let last = store.last_candle_time(pair.instrument.id, pair.timeframe_id).await?;

    let horizon = now - job.horizon();
    let mut cursor = match last {
        Some(last) => pair.timeframe.next_open(last).max(horizon),
        None => horizon,
    };
    let step = max_lookback(pair.timeframe.duration());
    let mut newest = last;
    let mut stored = 0;

    while cursor < now && !shutdown.is_stopped() {
        let end = (cursor + step).min(now);
        let request = FetchRequest::Range { start: cursor, end };

        match chain.fetch(pair.symbol(), pair.timeframe, request).await {
            ChainOutcome::Hit { rows, .. } => {
                let fresh: Vec<Candle> = rows
                    .into_iter()
                    .filter(|c| newest.map_or(true, |n| c.candle_time > n))
                    .collect();
                if let Some(max) = fresh.iter().map(|c| c.candle_time).max() {
                    newest = Some(max);
                    stored += store
                        .upsert_candles(pair.instrument.id, pair.timeframe_id, &fresh)
                        .await?;
                }
            }
            ChainOutcome::Exhausted { attempts, failed } if attempts > 0 && failed == attempts => {
                return Err(SyncError::AllSourcesFailed {
                    symbol: pair.symbol().to_string(),
                    timeframe: pair.timeframe.to_string(),
                    attempts,
                });
            }
            // Nothing traded in this chunk, e.g. before the symbol was listed
            ChainOutcome::Exhausted { .. } => {}
        }

        cursor = end;
    }

    debug!("Backfilled {} rows", stored);
    Ok(stored)
}
