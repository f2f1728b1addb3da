// SQL schema definitions, executed in order by PostgresManager::init_tables

pub const CREATE_INSTRUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS instruments (
    id SERIAL PRIMARY KEY,
    symbol TEXT NOT NULL UNIQUE,
    name TEXT,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#;

pub const CREATE_TIMEFRAMES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS timeframes (
    id SERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    seconds INTEGER NOT NULL
);
"#;

// The primary key includes the time column so the table can become a hypertable
pub const CREATE_CANDLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS candles (
    instrument_id INTEGER NOT NULL REFERENCES instruments(id),
    timeframe_id INTEGER NOT NULL REFERENCES timeframes(id),
    candle_time TIMESTAMPTZ NOT NULL,
    open DOUBLE PRECISION NOT NULL,
    high DOUBLE PRECISION NOT NULL,
    low DOUBLE PRECISION NOT NULL,
    close DOUBLE PRECISION NOT NULL,
    volume DOUBLE PRECISION NOT NULL,
    PRIMARY KEY (instrument_id, timeframe_id, candle_time)
);
"#;

pub const CREATE_ANALYTICS_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS analytics_metrics (
    instrument_id INTEGER NOT NULL REFERENCES instruments(id),
    timeframe_id INTEGER NOT NULL REFERENCES timeframes(id),
    metric_type TEXT NOT NULL,
    metric_window INTEGER NOT NULL,
    metric_displacement INTEGER NOT NULL,
    metric_timestamp TIMESTAMPTZ NOT NULL,
    value DOUBLE PRECISION NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (instrument_id, timeframe_id, metric_type, metric_window, metric_displacement, metric_timestamp)
);
"#;

pub const CREATE_INDICES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_candles_pair_time ON candles(instrument_id, timeframe_id, candle_time DESC)",
    "CREATE INDEX IF NOT EXISTS idx_analytics_metrics_series ON analytics_metrics(instrument_id, timeframe_id, metric_type, metric_window, metric_displacement)",
];

/// Hypertable name and time column, applied only when TimescaleDB is installed.
pub const HYPERTABLES: &[(&str, &str)] = &[("candles", "candle_time"), ("analytics_metrics", "metric_timestamp")];

/// Columns that have held the timeframe label across schema versions.
pub const TIMEFRAME_LABEL_COLUMNS: &[&str] = &["interval_name", "name", "code"];
