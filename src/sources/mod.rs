pub mod binance;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::database::models::Candle;
use crate::error::SourceError;
use crate::timeframe::Timeframe;

pub use binance::BinanceSource;

/// A fetcher of OHLCV rows. Sources are unreliable: any error or empty result
/// simply moves the chain on to the next source.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, SourceError>;

    async fn fetch_recent(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>, SourceError>;
}

#[async_trait]
pub trait SymbolLister: Send + Sync {
    async fn list_available_symbols(&self) -> Result<HashSet<String>, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchRequest {
    Range { start: DateTime<Utc>, end: DateTime<Utc> },
    Recent { limit: usize },
}

/// Result of asking a single source.
#[derive(Debug)]
pub enum FetchOutcome {
    Rows(Vec<Candle>),
    Empty,
    Failed(SourceError),
}

impl From<Result<Vec<Candle>, SourceError>> for FetchOutcome {
    fn from(result: Result<Vec<Candle>, SourceError>) -> Self {
        match result {
            Ok(rows) if rows.is_empty() => FetchOutcome::Empty,
            Ok(rows) => FetchOutcome::Rows(rows),
            Err(e) => FetchOutcome::Failed(e),
        }
    }
}

/// Result of walking the whole chain.
#[derive(Debug)]
pub enum ChainOutcome {
    Hit { source: String, rows: Vec<Candle> },
    /// No source had rows. `failed` of the `attempts` calls errored, the rest were empty.
    Exhausted { attempts: usize, failed: usize },
}

/// Sources in priority order; the first non-empty answer wins.
#[derive(Clone, Default)]
pub struct SourceChain {
    sources: Vec<Arc<dyn MarketDataSource>>,
}

impl SourceChain {
    pub fn new(sources: Vec<Arc<dyn MarketDataSource>>) -> Self {
        Self { sources }
    }

    pub fn push(&mut self, source: Arc<dyn MarketDataSource>) {
        self.sources.push(source);
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name().to_string()).collect()
    }

    pub async fn fetch(&self, symbol: &str, timeframe: Timeframe, request: FetchRequest) -> ChainOutcome {
        let mut attempts = 0;
        let mut failed = 0;

        for source in &self.sources {
            attempts += 1;
            let result = match request {
                FetchRequest::Range { start, end } => source.fetch_range(symbol, timeframe, start, end).await,
                FetchRequest::Recent { limit } => source.fetch_recent(symbol, timeframe, limit).await,
            };

            match FetchOutcome::from(result) {
                FetchOutcome::Rows(rows) => {
                    debug!(source = source.name(), symbol, %timeframe, rows = rows.len(), "source returned rows");
                    return ChainOutcome::Hit {
                        source: source.name().to_string(),
                        rows,
                    };
                }
                FetchOutcome::Empty => {
                    debug!(source = source.name(), symbol, %timeframe, "source returned no rows");
                }
                FetchOutcome::Failed(e) => {
                    failed += 1;
                    warn!(source = source.name(), symbol, %timeframe, "source fetch failed: {}", e);
                }
            }
        }

        ChainOutcome::Exhausted { attempts, failed }
    }
}
