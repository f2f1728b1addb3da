// src/timeframe.rs
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Candle bucket durations known to the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "3m")]
    M3,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "2h")]
    H2,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "12h")]
    H12,
    #[serde(rename = "1d")]
    D1,
    #[serde(rename = "1w")]
    W1,
    #[serde(rename = "1mo")]
    Mo1,
}

// Canonical code first, then every label seen in legacy tables and exchange APIs.
// Exact matches win: "1m" and "1M" mean different things.
const ALIASES: &[(Timeframe, &[&str])] = &[
    (Timeframe::M1, &["1m", "1min", "1minute", "m1"]),
    (Timeframe::M3, &["3m", "3min", "3minute", "m3"]),
    (Timeframe::M5, &["5m", "5min", "5minute", "m5"]),
    (Timeframe::M15, &["15m", "15min", "15minute", "m15"]),
    (Timeframe::M30, &["30m", "30min", "30minute", "m30"]),
    (Timeframe::H1, &["1h", "1hour", "60m", "h1"]),
    (Timeframe::H2, &["2h", "2hour", "120m", "h2"]),
    (Timeframe::H4, &["4h", "4hour", "240m", "h4"]),
    (Timeframe::H6, &["6h", "6hour", "h6"]),
    (Timeframe::H12, &["12h", "12hour", "h12"]),
    (Timeframe::D1, &["1d", "1day", "24h", "d1"]),
    (Timeframe::W1, &["1w", "1week", "7d", "w1"]),
    (Timeframe::Mo1, &["1mo", "1month", "1M", "mo1"]),
];

impl Timeframe {
    pub const ALL: [Timeframe; 13] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H12,
        Timeframe::D1,
        Timeframe::W1,
        Timeframe::Mo1,
    ];

    /// Canonical code stored in the `timeframes` table.
    pub fn code(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
            Timeframe::W1 => "1w",
            Timeframe::Mo1 => "1mo",
        }
    }

    /// Interval code understood by the exchange kline endpoints.
    pub fn exchange_code(&self) -> &'static str {
        match self {
            Timeframe::Mo1 => "1M",
            other => other.code(),
        }
    }

    pub fn seconds(&self) -> i64 {
        match self {
            Timeframe::M1 => 60,
            Timeframe::M3 => 3 * 60,
            Timeframe::M5 => 5 * 60,
            Timeframe::M15 => 15 * 60,
            Timeframe::M30 => 30 * 60,
            Timeframe::H1 => 3600,
            Timeframe::H2 => 2 * 3600,
            Timeframe::H4 => 4 * 3600,
            Timeframe::H6 => 6 * 3600,
            Timeframe::H12 => 12 * 3600,
            Timeframe::D1 => 86_400,
            Timeframe::W1 => 7 * 86_400,
            Timeframe::Mo1 => 30 * 86_400,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.seconds())
    }

    /// Open time of the candle following the one opened at `open`.
    /// Months are calendar months; everything else is a fixed step.
    pub fn next_open(&self, open: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Timeframe::Mo1 => open
                .checked_add_months(Months::new(1))
                .unwrap_or_else(|| open + self.duration()),
            _ => open + self.duration(),
        }
    }

    /// Minimum time between two synchronization attempts for this timeframe.
    pub fn update_interval(&self) -> Duration {
        match self {
            Timeframe::M1 | Timeframe::M3 | Timeframe::M5 => Duration::seconds(60),
            Timeframe::M15 | Timeframe::M30 => Duration::minutes(15),
            Timeframe::H1 | Timeframe::H2 => Duration::hours(1),
            Timeframe::H4 | Timeframe::H6 | Timeframe::H12 => Duration::hours(4),
            Timeframe::D1 | Timeframe::W1 | Timeframe::Mo1 => Duration::hours(24),
        }
    }

    /// Resolve any known label for a timeframe.
    pub fn from_alias(label: &str) -> Option<Self> {
        let label = label.trim();
        ALIASES
            .iter()
            .find(|(_, aliases)| aliases.contains(&label))
            .map(|(tf, _)| *tf)
            .or_else(|| {
                // Fall back to a case-insensitive match, skipping the ambiguous m/M pair
                let lower = label.to_lowercase();
                if lower != label && lower.ends_with('m') {
                    return None;
                }
                ALIASES
                    .iter()
                    .find(|(_, aliases)| aliases.iter().any(|a| a.to_lowercase() == lower))
                    .map(|(tf, _)| *tf)
            })
    }

    pub fn from_seconds(seconds: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|tf| tf.seconds() == seconds)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Timeframe {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::from_alias(s).ok_or_else(|| SyncError::UnknownTimeframe(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonical_codes_round_trip() {
        for tf in Timeframe::ALL {
            assert_eq!(Timeframe::from_alias(tf.code()), Some(tf));
        }
    }

    #[test]
    fn month_and_minute_are_not_confused() {
        assert_eq!(Timeframe::from_alias("1M"), Some(Timeframe::Mo1));
        assert_eq!(Timeframe::from_alias("1m"), Some(Timeframe::M1));
        assert_eq!(Timeframe::Mo1.exchange_code(), "1M");
    }

    #[test]
    fn legacy_aliases_resolve() {
        assert_eq!(Timeframe::from_alias("60m"), Some(Timeframe::H1));
        assert_eq!(Timeframe::from_alias("1Hour"), Some(Timeframe::H1));
        assert_eq!(Timeframe::from_alias(" 1day "), Some(Timeframe::D1));
        assert_eq!(Timeframe::from_alias("7d"), Some(Timeframe::W1));
        assert_eq!(Timeframe::from_alias("2x"), None);
        assert!("fortnight".parse::<Timeframe>().is_err());
    }

    #[test]
    fn update_intervals_follow_granularity() {
        assert_eq!(Timeframe::M5.update_interval(), Duration::seconds(60));
        assert_eq!(Timeframe::M30.update_interval(), Duration::minutes(15));
        assert_eq!(Timeframe::H2.update_interval(), Duration::hours(1));
        assert_eq!(Timeframe::H12.update_interval(), Duration::hours(4));
        assert_eq!(Timeframe::Mo1.update_interval(), Duration::hours(24));
    }

    #[test]
    fn next_month_opens_on_the_first() {
        let feb = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let mar = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert_eq!(Timeframe::Mo1.next_open(feb), mar);

        let dec = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
        assert_eq!(Timeframe::Mo1.next_open(dec), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(Timeframe::H4.next_open(feb), feb + Duration::hours(4));
    }

    #[test]
    fn durations_are_consistent_with_seconds() {
        assert_eq!(Timeframe::Mo1.duration(), Duration::days(30));
        assert_eq!(Timeframe::from_seconds(14_400), Some(Timeframe::H4));
    }
}
