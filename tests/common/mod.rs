// Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use candle_sync::database::models::{Candle, Instrument, MetricBatch, MetricKey, MetricPoint, TimeframeRecord};
use candle_sync::database::store::{CandleStore, InstrumentRegistry, MetricStore};
use candle_sync::database::MemoryStore;
use candle_sync::error::{SourceError, StoreError, StoreResult};
use candle_sync::sources::{MarketDataSource, SymbolLister};
use candle_sync::Timeframe;
use chrono::{DateTime, Datelike, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Construct a UTC `DateTime` from components for readability in tests.
pub fn dt(y: i32, m: u32, d: u32, hh: u32, mm: u32, ss: u32) -> DateTime<Utc> {
    let date = chrono::NaiveDate::from_ymd_opt(y, m, d).expect("invalid date");
    let naive = date.and_hms_opt(hh, mm, ss).expect("invalid time components");
    DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc)
}

/// A candle whose prices are all `close`.
pub fn candle(t: DateTime<Utc>, close: f64) -> Candle {
    Candle::new(t, close, close, close, close, 1.0)
}

/// Consecutive candles of `timeframe` starting at `start` with closes 1, 2, 3...
pub fn ramp(start: DateTime<Utc>, timeframe: Timeframe, n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| candle(start + timeframe.duration() * i as i32, (i + 1) as f64))
        .collect()
}

/// Epoch-aligned bars of `timeframe` in `[start, end]`, never later than `clock`.
pub fn exchange_bars(
    timeframe: Timeframe,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    clock: DateTime<Utc>,
) -> Vec<Candle> {
    let step = timeframe.seconds();
    let end = end.min(clock).timestamp();
    let mut t = start.timestamp().div_euclid(step) * step;
    if t < start.timestamp() {
        t += step;
    }
    let mut out = Vec::new();
    while t <= end {
        let time = DateTime::<Utc>::from_timestamp(t, 0).expect("timestamp in range");
        out.push(candle(time, (t / step) as f64));
        t += step;
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Range {
        symbol: String,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Recent {
        symbol: String,
        timeframe: Timeframe,
        limit: usize,
    },
}

impl Call {
    pub fn symbol(&self) -> &str {
        match self {
            Call::Range { symbol, .. } | Call::Recent { symbol, .. } => symbol,
        }
    }
}

type Behaviour = Arc<dyn Fn(&Call) -> Result<Vec<Candle>, SourceError> + Send + Sync>;

/// Scripted market data source that records every call it receives.
pub struct MockSource {
    name: String,
    behaviour: Behaviour,
    calls: Mutex<Vec<Call>>,
}

impl MockSource {
    pub fn builder(name: &str) -> MockSourceBuilder {
        MockSourceBuilder {
            name: name.to_string(),
            behaviour: Arc::new(|_| Ok(Vec::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn answer(&self, call: Call) -> Result<Vec<Candle>, SourceError> {
        let result = (self.behaviour)(&call);
        self.calls.lock().push(call);
        result
    }
}

pub struct MockSourceBuilder {
    name: String,
    behaviour: Behaviour,
}

impl MockSourceBuilder {
    pub fn returns_rows(mut self, rows: Vec<Candle>) -> Self {
        self.behaviour = Arc::new(move |_| Ok(rows.clone()));
        self
    }

    pub fn returns_empty(mut self) -> Self {
        self.behaviour = Arc::new(|_| Ok(Vec::new()));
        self
    }

    pub fn fails(mut self) -> Self {
        self.behaviour = Arc::new(|_| {
            Err(SourceError::Status {
                status: 503,
                body: "service unavailable".to_string(),
            })
        });
        self
    }

    /// Behave like an exchange whose latest closed bar is at or before `clock`.
    pub fn exchange(mut self, clock: DateTime<Utc>) -> Self {
        self.behaviour = Arc::new(move |call| {
            Ok(match call {
                Call::Range {
                    timeframe, start, end, ..
                } => exchange_bars(*timeframe, *start, *end, clock),
                Call::Recent { timeframe, limit, .. } => {
                    let start = clock - timeframe.duration() * (*limit as i32);
                    let mut bars = exchange_bars(*timeframe, start, clock, clock);
                    let skip = bars.len().saturating_sub(*limit);
                    bars.drain(..skip);
                    bars
                }
            })
        });
        self
    }

    pub fn with_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Call) -> Result<Vec<Candle>, SourceError> + Send + Sync + 'static,
    {
        self.behaviour = Arc::new(f);
        self
    }

    pub fn build(self) -> Arc<MockSource> {
        Arc::new(MockSource {
            name: self.name,
            behaviour: self.behaviour,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl MarketDataSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, SourceError> {
        self.answer(Call::Range {
            symbol: symbol.to_string(),
            timeframe,
            start,
            end,
        })
    }

    async fn fetch_recent(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, SourceError> {
        self.answer(Call::Recent {
            symbol: symbol.to_string(),
            timeframe,
            limit,
        })
    }
}

/// Symbol listing with a fixed answer.
pub struct StaticLister {
    symbols: HashSet<String>,
}

impl StaticLister {
    pub fn new(symbols: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
        })
    }
}

#[async_trait]
impl SymbolLister for StaticLister {
    async fn list_available_symbols(&self) -> Result<HashSet<String>, SourceError> {
        Ok(self.symbols.clone())
    }
}

/// MemoryStore wrapper whose candle writes fail for selected instruments.
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: Mutex<HashSet<i32>>,
}

impl FlakyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_writes_for(&self, instrument_id: i32) {
        self.failing.lock().insert(instrument_id);
    }
}

#[async_trait]
impl CandleStore for FlakyStore {
    async fn last_candle_time(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Option<DateTime<Utc>>> {
        self.inner.last_candle_time(instrument_id, timeframe_id).await
    }

    async fn upsert_candles(&self, instrument_id: i32, timeframe_id: i32, rows: &[Candle]) -> StoreResult<u64> {
        if self.failing.lock().contains(&instrument_id) {
            return Err(StoreError::Unavailable("disk full".to_string()));
        }
        self.inner.upsert_candles(instrument_id, timeframe_id, rows).await
    }

    async fn get_candles(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Vec<Candle>> {
        self.inner.get_candles(instrument_id, timeframe_id).await
    }
}

#[async_trait]
impl MetricStore for FlakyStore {
    async fn upsert_metrics(&self, batch: &MetricBatch) -> StoreResult<u64> {
        self.inner.upsert_metrics(batch).await
    }

    async fn metric_series(&self, key: &MetricKey) -> StoreResult<Vec<MetricPoint>> {
        self.inner.metric_series(key).await
    }
}

#[async_trait]
impl InstrumentRegistry for FlakyStore {
    async fn instruments(&self) -> StoreResult<Vec<Instrument>> {
        self.inner.instruments().await
    }

    async fn timeframes(&self) -> StoreResult<Vec<TimeframeRecord>> {
        self.inner.timeframes().await
    }

    async fn ensure_instrument(&self, symbol: &str) -> StoreResult<Instrument> {
        self.inner.ensure_instrument(symbol).await
    }
}

/// Memory store with the given timeframes and instruments registered.
pub async fn seeded_store(timeframes: &[Timeframe], symbols: &[&str]) -> MemoryStore {
    let store = MemoryStore::with_timeframes(timeframes);
    for symbol in symbols {
        store.ensure_instrument(symbol).await.expect("register instrument");
    }
    store
}

pub fn hours(n: i64) -> Duration {
    Duration::hours(n)
}

/// Calendar-month bars opening on the first of each month in `[start, end]`.
pub fn monthly_bars(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Candle> {
    let mut out = Vec::new();
    let mut open = dt(start.year(), start.month(), 1, 0, 0, 0);
    while open <= end {
        if open >= start {
            out.push(candle(open, open.month() as f64));
        }
        open = Timeframe::Mo1.next_open(open);
    }
    out
}

/// Source that answers month ranges the way the klines endpoint does: only bars opening at or after `start`.
pub fn monthly_exchange(name: &str) -> Arc<MockSource> {
    MockSource::builder(name)
        .with_fn(|call| {
            Ok(match call {
                Call::Range { start, end, .. } => monthly_bars(*start, *end),
                Call::Recent { .. } => Vec::new(),
            })
        })
        .build()
}
