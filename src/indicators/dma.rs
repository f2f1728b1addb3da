use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::database::models::{Candle, CandleData, MetricBatch, MetricKey, MetricPoint};
use crate::database::store::{CandleStore, InstrumentRegistry, MarketStore, MetricStore};
use crate::error::{StoreError, SyncError};

/// A (window, displacement) pair of the displaced moving average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DmaSpec {
    pub window: usize,
    pub displacement: usize,
}

pub const DEFAULT_DMA_SPECS: [DmaSpec; 3] = [
    DmaSpec::new(3, 3),
    DmaSpec::new(7, 5),
    DmaSpec::new(25, 5),
];

impl DmaSpec {
    pub const fn new(window: usize, displacement: usize) -> Self {
        Self { window, displacement }
    }

    pub fn metric_type(&self) -> String {
        format!("DMA_{}x{}", self.window, self.displacement)
    }

    pub fn key(&self, instrument_id: i32, timeframe_id: i32) -> MetricKey {
        MetricKey {
            instrument_id,
            timeframe_id,
            metric_type: self.metric_type(),
            window: self.window as i32,
            displacement: self.displacement as i32,
        }
    }
}

impl fmt::Display for DmaSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.window, self.displacement)
    }
}

/// Displaced moving average of `closes`, one value per input.
///
/// `dma[i]` is the simple moving average computed `displacement` bars after
/// `i`. Positions whose source average precedes the first full window take
/// the earliest average; the last `displacement` positions, which have no
/// future average yet, take the most recent actual averages so the line
/// reaches the last candle. Anything still undefined is forward filled, then
/// backward filled.
///
/// Returns an empty vector when there are fewer closes than `window`.
pub fn compute_dma(closes: &[f64], window: usize, displacement: usize) -> Vec<f64> {
    let n = closes.len();
    if window == 0 || n < window {
        return Vec::new();
    }

    let sma: Vec<Option<f64>> = (0..n)
        .map(|i| {
            if i + 1 < window {
                None
            } else {
                let sum: f64 = closes[i + 1 - window..=i].iter().sum();
                Some(sum / window as f64)
            }
        })
        .collect();

    let earliest_sma = sma[window - 1];

    let mut dma: Vec<Option<f64>> = (0..n)
        .map(|i| sma.get(i + displacement).copied().flatten())
        .collect();

    // Leading edge
    for i in 0..n {
        if i + displacement + 1 >= window {
            break;
        }
        dma[i] = earliest_sma;
    }

    // Trailing edge. When displacement exceeds n - window this also replaces
    // shifted values, some with None; the fills below close those, so the
    // line need not be monotone on a short series.
    for k in 0..displacement.min(n) {
        let idx = n - 1 - k;
        dma[idx] = sma[idx];
    }

    // Forward fill, then backward fill
    let mut last = None;
    for value in dma.iter_mut() {
        match value {
            Some(v) => last = Some(*v),
            None => *value = last,
        }
    }
    let mut next = None;
    for value in dma.iter_mut().rev() {
        match value {
            Some(v) => next = Some(*v),
            None => *value = next,
        }
    }

    dma.into_iter().flatten().collect()
}

/// DMA values paired with the candle times they are displayed at.
pub fn dma_points(times: &[DateTime<Utc>], closes: &[f64], spec: DmaSpec) -> Vec<MetricPoint> {
    compute_dma(closes, spec.window, spec.displacement)
        .into_iter()
        .zip(times.iter())
        .map(|(value, ts)| MetricPoint {
            metric_timestamp: *ts,
            value,
        })
        .collect()
}

/// Metric batches for every spec over one full candle series. Specs with
/// insufficient data produce no batch.
pub fn compute_batches(data: &CandleData, specs: &[DmaSpec]) -> Vec<MetricBatch> {
    specs
        .iter()
        .filter_map(|spec| {
            let points = dma_points(&data.times, &data.closes, *spec);
            if points.is_empty() {
                debug!(
                    "Not enough data points for DMA {} ({} candles)",
                    spec,
                    data.len()
                );
                return None;
            }
            Some(MetricBatch {
                key: spec.key(data.instrument_id, data.timeframe_id),
                points,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaReport {
    pub series: usize,
    pub points: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    pub pairs: usize,
    pub failed: usize,
    pub points: u64,
}

/// Computes DMA series from stored candles and writes them to the metric store.
pub struct DmaEngine {
    store: Arc<dyn MarketStore>,
    specs: Vec<DmaSpec>,
    batch_size: usize,
}

impl DmaEngine {
    pub fn new(store: Arc<dyn MarketStore>, specs: Vec<DmaSpec>) -> Self {
        Self {
            store,
            specs,
            batch_size: 32,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Recompute every configured spec over `candles` and upsert the results.
    /// `candles` must be the full known series for the pair, in time order.
    #[instrument(skip(self, candles), fields(candles = candles.len()))]
    pub async fn calculate_all_and_store(
        &self,
        candles: &[Candle],
        instrument_id: i32,
        timeframe_id: i32,
    ) -> Result<DmaReport, StoreError> {
        let data = CandleData::from_candles(instrument_id, timeframe_id, candles);
        let batches = compute_batches(&data, &self.specs);
        self.store_batches(&batches).await
    }

    async fn store_batches(&self, batches: &[MetricBatch]) -> Result<DmaReport, StoreError> {
        let mut report = DmaReport::default();
        for batch in batches {
            report.points += self.store.upsert_metrics(batch).await?;
            report.series += 1;
        }
        Ok(report)
    }

    /// Reload the pair's full candle history and recompute its DMA series.
    pub async fn refresh_pair(&self, instrument_id: i32, timeframe_id: i32) -> Result<DmaReport, StoreError> {
        let candles = self.store.get_candles(instrument_id, timeframe_id).await?;
        self.calculate_all_and_store(&candles, instrument_id, timeframe_id).await
    }

    /// Stored series ordered by time; empty when not computed yet.
    pub async fn retrieve(
        &self,
        instrument_id: i32,
        timeframe_id: i32,
        window: usize,
        displacement: usize,
    ) -> Result<Vec<MetricPoint>, StoreError> {
        let key = DmaSpec::new(window, displacement).key(instrument_id, timeframe_id);
        self.store.metric_series(&key).await
    }

    /// Recompute every (instrument, timeframe) pair. Candles are loaded per
    /// batch of pairs and the computation fans out over the rayon pool.
    pub async fn recompute_all(&self) -> Result<RecomputeReport, SyncError> {
        let instruments = self.store.instruments().await?;
        let timeframes = self.store.timeframes().await?;

        let pairs: Vec<(i32, i32)> = instruments
            .iter()
            .flat_map(|i| timeframes.iter().map(move |t| (i.id, t.id)))
            .collect();

        info!("Recomputing DMA for {} pairs", pairs.len());
        let mut report = RecomputeReport::default();

        for chunk in pairs.chunks(self.batch_size) {
            let mut series = Vec::with_capacity(chunk.len());
            for &(instrument_id, timeframe_id) in chunk {
                match self.store.get_candles(instrument_id, timeframe_id).await {
                    Ok(candles) => series.push(CandleData::from_candles(instrument_id, timeframe_id, &candles)),
                    Err(e) => {
                        error!("Failed to load candles for {}:{}: {}", instrument_id, timeframe_id, e);
                        report.failed += 1;
                    }
                }
            }

            let specs = self.specs.clone();
            let computed: Vec<Vec<MetricBatch>> = tokio::task::spawn_blocking(move || {
                series
                    .par_iter()
                    .map(|data| compute_batches(data, &specs))
                    .collect()
            })
            .await
            .map_err(|e| SyncError::Task(e.to_string()))?;

            for batches in computed {
                report.pairs += 1;
                match self.store_batches(&batches).await {
                    Ok(stored) => report.points += stored.points,
                    Err(e) => {
                        error!("Failed to store DMA metrics: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            "DMA recompute finished: pairs={}, failed={}, points={}",
            report.pairs, report.failed, report.points
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(n: usize) -> Vec<f64> {
        (1..=n).map(|v| v as f64).collect()
    }

    #[test]
    fn shifts_left_and_fills_trailing_edge() {
        let dma = compute_dma(&ramp(10), 3, 2);
        assert_eq!(dma, vec![2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 8.0, 9.0]);
    }

    #[test]
    fn leading_edge_takes_earliest_average() {
        // window 5 displacement 1: first shifted value lands at index 3
        let dma = compute_dma(&ramp(8), 5, 1);
        assert_eq!(dma, vec![3.0, 3.0, 3.0, 3.0, 4.0, 5.0, 6.0, 6.0]);
    }

    #[test]
    fn zero_displacement_is_plain_sma_with_leading_fill() {
        let dma = compute_dma(&ramp(5), 3, 0);
        assert_eq!(dma, vec![2.0, 2.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn insufficient_data_is_empty() {
        assert!(compute_dma(&ramp(4), 5, 2).is_empty());
        assert!(compute_dma(&[], 3, 3).is_empty());
        assert!(compute_dma(&ramp(4), 0, 1).is_empty());
    }

    #[test]
    fn short_series_with_large_displacement_has_no_gaps() {
        let dma = compute_dma(&ramp(3), 3, 5);
        assert_eq!(dma, vec![2.0, 2.0, 2.0]);
    }

    #[test]
    fn displacement_past_series_end_overwrites_shifted_values() {
        // sma = [_, _, 2, 3, 4]; only dma[0] has a shifted value before the trailing fill
        let dma = compute_dma(&ramp(5), 3, 4);
        assert_eq!(dma, vec![4.0, 4.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn means_are_not_truncated() {
        let dma = compute_dma(&[1.0, 2.0, 2.0], 3, 0);
        assert!((dma[2] - 5.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn metric_type_names_window_and_displacement() {
        assert_eq!(DmaSpec::new(25, 5).metric_type(), "DMA_25x5");
        let key = DmaSpec::new(3, 3).key(7, 2);
        assert_eq!((key.window, key.displacement, key.instrument_id), (3, 3, 7));
    }

    proptest! {
        #[test]
        fn every_position_is_defined(
            closes in prop::collection::vec(1.0f64..100_000.0, 1..200),
            window in 1usize..30,
            displacement in 0usize..10,
        ) {
            let dma = compute_dma(&closes, window, displacement);
            if closes.len() < window {
                prop_assert!(dma.is_empty());
            } else {
                prop_assert_eq!(dma.len(), closes.len());
                prop_assert!(dma.iter().all(|v| v.is_finite()));
                let lo = closes.iter().cloned().fold(f64::INFINITY, f64::min);
                let hi = closes.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                prop_assert!(dma.iter().all(|v| *v >= lo - 1e-6 && *v <= hi + 1e-6));
            }
        }

        #[test]
        fn last_value_is_most_recent_average(
            closes in prop::collection::vec(1.0f64..1_000.0, 30..120),
            window in 1usize..25,
            displacement in 1usize..6,
        ) {
            let dma = compute_dma(&closes, window, displacement);
            let n = closes.len();
            let expected: f64 = closes[n - window..].iter().sum::<f64>() / window as f64;
            prop_assert!((dma[n - 1] - expected).abs() < 1e-9);
        }
    }
}
