use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::database::models::{Candle, Instrument, MetricBatch, MetricKey, MetricPoint, TimeframeRecord};
use crate::database::store::{CandleStore, InstrumentRegistry, MetricStore};
use crate::error::{StoreError, StoreResult};
use crate::timeframe::Timeframe;

#[derive(Default)]
struct Inner {
    instruments: Vec<Instrument>,
    timeframes: Vec<TimeframeRecord>,
    candles: HashMap<(i32, i32), BTreeMap<DateTime<Utc>, Candle>>,
    metrics: HashMap<MetricKey, BTreeMap<DateTime<Utc>, f64>>,
}

impl Inner {
    fn check_pair(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<()> {
        if !self.instruments.iter().any(|i| i.id == instrument_id) {
            return Err(StoreError::UnknownInstrument(instrument_id));
        }
        if !self.timeframes.iter().any(|t| t.id == timeframe_id) {
            return Err(StoreError::UnknownTimeframe(timeframe_id));
        }
        Ok(())
    }
}

/// In-process store with the same keying rules as the Postgres tables.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with one timeframe row per entry, ids starting at 1.
    pub fn with_timeframes(timeframes: &[Timeframe]) -> Self {
        let store = Self::new();
        for tf in timeframes {
            store.add_timeframe_label(tf.code());
        }
        store
    }

    /// Register a raw timeframe label, as a legacy table might hold it.
    pub fn add_timeframe_label(&self, label: &str) -> TimeframeRecord {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.timeframes.iter().find(|t| t.label == label) {
            return existing.clone();
        }
        let record = TimeframeRecord {
            id: inner.timeframes.len() as i32 + 1,
            label: label.to_string(),
        };
        inner.timeframes.push(record.clone());
        record
    }

    pub fn timeframe_id(&self, timeframe: Timeframe) -> Option<i32> {
        self.inner
            .read()
            .timeframes
            .iter()
            .find(|t| t.resolve().ok() == Some(timeframe))
            .map(|t| t.id)
    }

    pub fn candle_count(&self, instrument_id: i32, timeframe_id: i32) -> usize {
        self.inner
            .read()
            .candles
            .get(&(instrument_id, timeframe_id))
            .map_or(0, |series| series.len())
    }
}

#[async_trait]
impl CandleStore for MemoryStore {
    async fn last_candle_time(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Option<DateTime<Utc>>> {
        let inner = self.inner.read();
        inner.check_pair(instrument_id, timeframe_id)?;
        Ok(inner
            .candles
            .get(&(instrument_id, timeframe_id))
            .and_then(|series| series.keys().next_back().copied()))
    }

    async fn upsert_candles(&self, instrument_id: i32, timeframe_id: i32, rows: &[Candle]) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        inner.check_pair(instrument_id, timeframe_id)?;
        let series = inner.candles.entry((instrument_id, timeframe_id)).or_default();
        let mut inserted = 0;
        for row in rows {
            if !series.contains_key(&row.candle_time) {
                series.insert(row.candle_time, row.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_candles(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Vec<Candle>> {
        let inner = self.inner.read();
        inner.check_pair(instrument_id, timeframe_id)?;
        Ok(inner
            .candles
            .get(&(instrument_id, timeframe_id))
            .map(|series| series.values().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl MetricStore for MemoryStore {
    async fn upsert_metrics(&self, batch: &MetricBatch) -> StoreResult<u64> {
        let mut inner = self.inner.write();
        inner.check_pair(batch.key.instrument_id, batch.key.timeframe_id)?;
        let series = inner.metrics.entry(batch.key.clone()).or_default();
        for point in &batch.points {
            series.insert(point.metric_timestamp, point.value);
        }
        Ok(batch.points.len() as u64)
    }

    async fn metric_series(&self, key: &MetricKey) -> StoreResult<Vec<MetricPoint>> {
        let inner = self.inner.read();
        Ok(inner
            .metrics
            .get(key)
            .map(|series| {
                series
                    .iter()
                    .map(|(ts, value)| MetricPoint {
                        metric_timestamp: *ts,
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl InstrumentRegistry for MemoryStore {
    async fn instruments(&self) -> StoreResult<Vec<Instrument>> {
        Ok(self.inner.read().instruments.clone())
    }

    async fn timeframes(&self) -> StoreResult<Vec<TimeframeRecord>> {
        Ok(self.inner.read().timeframes.clone())
    }

    async fn ensure_instrument(&self, symbol: &str) -> StoreResult<Instrument> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.instruments.iter().find(|i| i.symbol == symbol) {
            return Ok(existing.clone());
        }
        let instrument = Instrument {
            id: inner.instruments.len() as i32 + 1,
            symbol: symbol.to_string(),
        };
        inner.instruments.push(instrument.clone());
        Ok(instrument)
    }
}
