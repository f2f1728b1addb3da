use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::error::SyncError;
use crate::timeframe::Timeframe;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Instrument {
    pub id: i32,
    pub symbol: String,
}

/// A row of the `timeframes` table as stored, before its label is resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct TimeframeRecord {
    pub id: i32,
    pub label: String,
}

impl TimeframeRecord {
    pub fn resolve(&self) -> Result<Timeframe, SyncError> {
        self.label.parse()
    }
}

/// One OHLCV bucket. Identity columns live on the surrounding call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Candle {
    pub candle_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(candle_time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            candle_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

// Columnar view of a candle series for indicator calculation
#[derive(Debug, Clone, Default)]
pub struct CandleData {
    pub instrument_id: i32,
    pub timeframe_id: i32,
    pub times: Vec<DateTime<Utc>>,
    pub closes: Vec<f64>,
}

impl CandleData {
    pub fn new(instrument_id: i32, timeframe_id: i32) -> Self {
        Self {
            instrument_id,
            timeframe_id,
            ..Default::default()
        }
    }

    pub fn from_candles(instrument_id: i32, timeframe_id: i32, candles: &[Candle]) -> Self {
        let mut data = Self::new(instrument_id, timeframe_id);
        data.times.reserve(candles.len());
        data.closes.reserve(candles.len());
        for candle in candles {
            data.times.push(candle.candle_time);
            data.closes.push(candle.close);
        }
        data
    }

    pub fn len(&self) -> usize {
        self.closes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closes.is_empty()
    }
}

/// Key of a metric series; a stored metric adds a timestamp and a value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub instrument_id: i32,
    pub timeframe_id: i32,
    pub metric_type: String,
    pub window: i32,
    pub displacement: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, FromRow)]
pub struct MetricPoint {
    pub metric_timestamp: DateTime<Utc>,
    pub value: f64,
}

// Batch of metric points for one series, for efficient storage
#[derive(Debug, Clone)]
pub struct MetricBatch {
    pub key: MetricKey,
    pub points: Vec<MetricPoint>,
}
