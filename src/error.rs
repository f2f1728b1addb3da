// src/error.rs
use thiserror::Error;

/// Failures raised by candle and metric storage.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("unknown instrument id {0}")]
    UnknownInstrument(i32),

    #[error("unknown timeframe id {0}")]
    UnknownTimeframe(i32),

    #[error("timeframes table has none of the label columns {0:?}")]
    MissingLabelColumn(&'static [&'static str]),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures raised by a single market data source call.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited (status {status})")]
    RateLimited { status: u16 },

    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Failures of one synchronization attempt for a single pair.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("all {attempts} sources failed for {symbol} {timeframe}")]
    AllSourcesFailed {
        symbol: String,
        timeframe: String,
        attempts: usize,
    },

    #[error("unknown timeframe '{0}'")]
    UnknownTimeframe(String),

    #[error("unknown instrument '{0}'")]
    UnknownSymbol(String),

    #[error("background task failed: {0}")]
    Task(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
