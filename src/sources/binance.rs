use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::database::models::Candle;
use crate::error::SourceError;
use crate::sources::{MarketDataSource, SymbolLister};
use crate::timeframe::Timeframe;

/// Maximum rows the klines endpoint returns per request.
pub const KLINES_PAGE_LIMIT: usize = 1000;

const WEIGHT_WARN_THRESHOLD: u32 = 1000;

/// Binance spot REST market data (public endpoints only).
pub struct BinanceSource {
    name: String,
    base_url: String,
    quote_asset: String,
    client: reqwest::Client,
    page_delay: Duration,
}

impl BinanceSource {
    pub fn new(name: &str, base_url: &str, quote_asset: &str, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        debug!("BinanceSource {} initialised (base_url={})", name, base_url);

        Ok(Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            quote_asset: quote_asset.to_string(),
            client,
            page_delay: Duration::from_millis(100),
        })
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value, SourceError> {
        let resp = self.client.get(url).send().await?;

        if let Some(weight) = resp
            .headers()
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        {
            if weight >= WEIGHT_WARN_THRESHOLD {
                warn!(source = %self.name, used_weight = weight, "rate-limit weight above warning threshold");
            }
        }

        let status = resp.status();
        let body = resp.text().await?;

        if status.as_u16() == 429 || status.as_u16() == 418 {
            return Err(SourceError::RateLimited {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                body,
            });
        }

        serde_json::from_str(&body).map_err(|e| SourceError::Malformed(format!("invalid json: {}", e)))
    }

    async fn get_klines(&self, query: &str) -> Result<Vec<Kline>, SourceError> {
        let url = format!("{}/api/v3/klines?{}", self.base_url, query);
        let body = self.get_json(&url).await?;
        parse_klines(&body)
    }
}

/// A parsed kline with the close time needed for paging.
#[derive(Debug, Clone, PartialEq)]
pub struct Kline {
    pub candle: Candle,
    pub close_time_ms: i64,
}

fn parse_str_f64(val: &serde_json::Value) -> Result<f64, SourceError> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|_| SourceError::Malformed(format!("failed to parse '{}' as f64", s)))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        Err(SourceError::Malformed(format!("expected string or number, got: {}", val)))
    }
}

fn millis_to_time(ms: i64) -> Result<DateTime<Utc>, SourceError> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| SourceError::Malformed(format!("timestamp {} out of range", ms)))
}

pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Kline>, SourceError> {
    let raw = body
        .as_array()
        .ok_or_else(|| SourceError::Malformed("klines response is not an array".into()))?;

    let mut klines = Vec::with_capacity(raw.len());

    for entry in raw {
        let arr = entry
            .as_array()
            .ok_or_else(|| SourceError::Malformed("kline entry is not an array".into()))?;

        if arr.len() < 7 {
            warn!("skipping malformed kline entry with {} elements", arr.len());
            continue;
        }

        let open_time = arr[0]
            .as_i64()
            .ok_or_else(|| SourceError::Malformed("kline open time is not an integer".into()))?;
        let close_time_ms = arr[6]
            .as_i64()
            .ok_or_else(|| SourceError::Malformed("kline close time is not an integer".into()))?;

        klines.push(Kline {
            candle: Candle::new(
                millis_to_time(open_time)?,
                parse_str_f64(&arr[1])?,
                parse_str_f64(&arr[2])?,
                parse_str_f64(&arr[3])?,
                parse_str_f64(&arr[4])?,
                parse_str_f64(&arr[5])?,
            ),
            close_time_ms,
        });
    }

    Ok(klines)
}

/// Candles of the klines that had closed before `cutoff_ms`. The still-open
/// bar would otherwise be stored with a partial close and never rewritten.
pub fn closed_candles(klines: Vec<Kline>, cutoff_ms: i64) -> Vec<Candle> {
    klines
        .into_iter()
        .filter(|k| k.close_time_ms < cutoff_ms)
        .map(|k| k.candle)
        .collect()
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    quote_asset: String,
}

pub fn parse_exchange_info(body: serde_json::Value, quote_asset: &str) -> Result<HashSet<String>, SourceError> {
    let info: ExchangeInfo =
        serde_json::from_value(body).map_err(|e| SourceError::Malformed(format!("invalid exchangeInfo: {}", e)))?;

    Ok(info
        .symbols
        .into_iter()
        .filter(|s| s.status == "TRADING")
        .filter(|s| quote_asset.is_empty() || s.quote_asset == quote_asset)
        .map(|s| s.symbol)
        .collect())
}

#[async_trait]
impl MarketDataSource for BinanceSource {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, SourceError> {
        let end_ms = end.timestamp_millis();
        let mut cursor = start.timestamp_millis();
        let mut klines = Vec::new();

        while cursor < end_ms {
            let query = format!(
                "symbol={}&interval={}&startTime={}&endTime={}&limit={}",
                symbol,
                timeframe.exchange_code(),
                cursor,
                end_ms,
                KLINES_PAGE_LIMIT
            );
            let page = self.get_klines(&query).await?;
            let page_len = page.len();

            let Some(last) = page.last() else {
                break;
            };
            let next = last.close_time_ms + 1;
            klines.extend(page);

            if page_len < KLINES_PAGE_LIMIT || next <= cursor {
                break;
            }
            cursor = next;
            tokio::time::sleep(self.page_delay).await;
        }

        // Bars opened before `end` but closing after it stay, or a chunked walk would skip them
        let candles = closed_candles(klines, Utc::now().timestamp_millis());

        debug!(symbol, %timeframe, count = candles.len(), "klines range fetched");
        Ok(candles)
    }

    #[instrument(skip(self), fields(source = %self.name))]
    async fn fetch_recent(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, SourceError> {
        let query = format!(
            "symbol={}&interval={}&limit={}",
            symbol,
            timeframe.exchange_code(),
            limit.clamp(1, KLINES_PAGE_LIMIT)
        );
        let klines = self.get_klines(&query).await?;
        let candles = closed_candles(klines, Utc::now().timestamp_millis());

        debug!(symbol, %timeframe, count = candles.len(), "recent klines fetched");
        Ok(candles)
    }
}

#[async_trait]
impl SymbolLister for BinanceSource {
    async fn list_available_symbols(&self) -> Result<HashSet<String>, SourceError> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let body = self.get_json(&url).await?;
        parse_exchange_info(body, &self.quote_asset)
    }
}

impl std::fmt::Debug for BinanceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceSource")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("quote_asset", &self.quote_asset)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_kline_arrays() {
        let body = json!([
            [1704067200000i64, "42000.1", "42100.0", "41900.5", "42050.0", "12.5", 1704067259999i64, "0", 10, "0", "0", "0"],
            [1704067260000i64, "42050.0", "42060.0", "42000.0", "42010.0", "3.25", 1704067319999i64, "0", 4, "0", "0", "0"]
        ]);

        let klines = parse_klines(&body).unwrap();
        assert_eq!(klines.len(), 2);
        assert_eq!(klines[0].candle.candle_time.timestamp_millis(), 1704067200000);
        assert_eq!(klines[0].candle.close, 42050.0);
        assert_eq!(klines[1].candle.volume, 3.25);
        assert_eq!(klines[1].close_time_ms, 1704067319999);
    }

    #[test]
    fn open_kline_is_dropped() {
        let body = json!([
            [1704067200000i64, "42000.1", "42100.0", "41900.5", "42050.0", "12.5", 1704067259999i64, "0", 10, "0", "0", "0"],
            [1704067260000i64, "42050.0", "42060.0", "42000.0", "42010.0", "3.25", 1704067319999i64, "0", 4, "0", "0", "0"]
        ]);
        let klines = parse_klines(&body).unwrap();

        // Clock inside the second minute: that bar is still forming
        let candles = closed_candles(klines.clone(), 1704067290000);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].candle_time.timestamp_millis(), 1704067200000);

        // A close exactly at the cutoff has not happened yet either
        assert_eq!(closed_candles(klines.clone(), 1704067259999).len(), 0);
        assert_eq!(closed_candles(klines, 1704067320000).len(), 2);
    }

    #[test]
    fn rejects_non_numeric_prices() {
        let body = json!([[1704067200000i64, "abc", "1", "1", "1", "1", 1704067259999i64]]);
        assert!(matches!(parse_klines(&body), Err(SourceError::Malformed(_))));
    }

    #[test]
    fn rejects_non_array_payload() {
        let body = json!({"code": -1121, "msg": "Invalid symbol."});
        assert!(parse_klines(&body).is_err());
    }

    #[test]
    fn exchange_info_keeps_trading_quote_pairs() {
        let body = json!({
            "timezone": "UTC",
            "symbols": [
                {"symbol": "BTCUSDT", "status": "TRADING", "baseAsset": "BTC", "quoteAsset": "USDT"},
                {"symbol": "ETHBTC", "status": "TRADING", "baseAsset": "ETH", "quoteAsset": "BTC"},
                {"symbol": "LUNAUSDT", "status": "BREAK", "baseAsset": "LUNA", "quoteAsset": "USDT"}
            ]
        });

        let symbols = parse_exchange_info(body, "USDT").unwrap();
        assert_eq!(symbols.len(), 1);
        assert!(symbols.contains("BTCUSDT"));
    }
}
