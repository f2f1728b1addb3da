use chrono::Duration;
use std::cmp::Ordering;
use std::fmt;

use crate::database::models::{Instrument, TimeframeRecord};
use crate::error::SyncError;
use crate::timeframe::Timeframe;

/// One (instrument, timeframe) series kept in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPair {
    pub instrument: Instrument,
    pub timeframe_id: i32,
    pub timeframe: Timeframe,
}

impl SyncPair {
    pub fn new(instrument: Instrument, timeframe_id: i32, timeframe: Timeframe) -> Self {
        Self {
            instrument,
            timeframe_id,
            timeframe,
        }
    }

    pub fn resolve(instrument: &Instrument, record: &TimeframeRecord) -> Result<Self, SyncError> {
        Ok(Self::new(instrument.clone(), record.id, record.resolve()?))
    }

    pub fn symbol(&self) -> &str {
        &self.instrument.symbol
    }
}

impl fmt::Display for SyncPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.instrument.symbol, self.timeframe)
    }
}

// Passes walk pairs by symbol, then timeframe code
impl Ord for SyncPair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instrument
            .symbol
            .cmp(&other.instrument.symbol)
            .then_with(|| self.timeframe.code().cmp(other.timeframe.code()))
            .then_with(|| self.timeframe_id.cmp(&other.timeframe_id))
    }
}

impl PartialOrd for SyncPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Historical backfill of one pair over the last `days` days.
#[derive(Debug, Clone)]
pub struct BackfillJob {
    pub pair: SyncPair,
    pub days: i64,
}

impl BackfillJob {
    pub fn new(pair: SyncPair, days: i64) -> Self {
        Self { pair, days }
    }

    pub fn horizon(&self) -> Duration {
        Duration::days(self.days)
    }
}
