use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::database::models::{Candle, Instrument, MetricBatch, MetricKey, MetricPoint, TimeframeRecord};
use crate::error::StoreResult;

/// Persistence of OHLCV rows keyed by (instrument, timeframe, candle time).
#[async_trait]
pub trait CandleStore: Send + Sync {
    async fn last_candle_time(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Option<DateTime<Utc>>>;

    /// Insert rows whose key is absent. Existing keys are left untouched.
    /// Returns the number of rows actually inserted.
    async fn upsert_candles(&self, instrument_id: i32, timeframe_id: i32, rows: &[Candle]) -> StoreResult<u64>;

    /// Full series ordered by candle time ascending.
    async fn get_candles(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Vec<Candle>>;
}

/// Persistence of derived metrics. Writes overwrite the stored value.
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn upsert_metrics(&self, batch: &MetricBatch) -> StoreResult<u64>;

    async fn upsert_metric(&self, key: &MetricKey, point: MetricPoint) -> StoreResult<()> {
        let batch = MetricBatch {
            key: key.clone(),
            points: vec![point],
        };
        self.upsert_metrics(&batch).await.map(|_| ())
    }

    /// Series for a key ordered by timestamp ascending. Empty when never computed.
    async fn metric_series(&self, key: &MetricKey) -> StoreResult<Vec<MetricPoint>>;
}

#[async_trait]
pub trait InstrumentRegistry: Send + Sync {
    async fn instruments(&self) -> StoreResult<Vec<Instrument>>;

    async fn timeframes(&self) -> StoreResult<Vec<TimeframeRecord>>;

    /// Look up an instrument by symbol, creating it on first reference.
    async fn ensure_instrument(&self, symbol: &str) -> StoreResult<Instrument>;
}

/// Everything the scheduler and the DMA engine need from storage.
pub trait MarketStore: CandleStore + MetricStore + InstrumentRegistry {}

impl<T> MarketStore for T where T: CandleStore + MetricStore + InstrumentRegistry + ?Sized {}
