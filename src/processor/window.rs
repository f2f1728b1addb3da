use chrono::{DateTime, Duration, Utc};

use crate::timeframe::Timeframe;

/// Periods fetched when a pair has no candles yet.
pub const BOOTSTRAP_PERIODS: i32 = 100;

/// What a pair is missing, as decided from its last stored candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchWindow {
    UpToDate,
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        /// No candles stored yet; fetch the most recent periods instead of a range.
        cold: bool,
    },
}

/// Upper bound on how far back a single incremental fetch may reach.
pub fn max_lookback(timeframe_duration: Duration) -> Duration {
    if timeframe_duration <= Duration::minutes(5) {
        Duration::days(7)
    } else if timeframe_duration <= Duration::minutes(30) {
        Duration::days(30)
    } else if timeframe_duration <= Duration::hours(2) {
        Duration::days(90)
    } else {
        Duration::days(365)
    }
}

pub fn compute_fetch_window(
    last_candle_time: Option<DateTime<Utc>>,
    timeframe: Timeframe,
    now: DateTime<Utc>,
) -> FetchWindow {
    compute_fetch_window_with(last_candle_time, timeframe, now, BOOTSTRAP_PERIODS)
}

/// Like [`compute_fetch_window`] with a configurable cold-start depth.
pub fn compute_fetch_window_with(
    last_candle_time: Option<DateTime<Utc>>,
    timeframe: Timeframe,
    now: DateTime<Utc>,
    bootstrap_periods: i32,
) -> FetchWindow {
    let duration = timeframe.duration();
    let (start, cold) = match last_candle_time {
        None => (now - duration * bootstrap_periods, true),
        Some(last) => {
            // The clamp only ever moves the start forward
            let floor = now - max_lookback(duration);
            (timeframe.next_open(last).max(floor), false)
        }
    };

    if start >= now {
        FetchWindow::UpToDate
    } else {
        FetchWindow::Range { start, end: now, cold }
    }
}
