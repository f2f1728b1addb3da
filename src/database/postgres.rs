use crate::database::models::{Candle, Instrument, MetricBatch, MetricKey, MetricPoint, TimeframeRecord};
use crate::database::schema;
use crate::database::store::{CandleStore, InstrumentRegistry, MetricStore};
use crate::error::{StoreError, StoreResult};
use crate::timeframe::Timeframe;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use std::collections::HashSet;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

pub struct PostgresManager {
    pool: PgPool,
    // Resolved on first use; legacy databases name this column differently
    label_column: OnceCell<&'static str>,
}

impl PostgresManager {
    pub async fn new(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        dbname: &str,
        max_connections: u32,
    ) -> Result<Self> {
        let connection_string = format!(
            "postgres://{}:{}@{}:{}/{}",
            user, password, host, port, dbname
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(&connection_string)
            .await
            .context("Failed to create database connection pool")?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            label_column: OnceCell::new(),
        }
    }

    // Create tables if they don't exist
    pub async fn init_tables(&self) -> Result<()> {
        for ddl in [
            schema::CREATE_INSTRUMENTS_TABLE,
            schema::CREATE_TIMEFRAMES_TABLE,
            schema::CREATE_CANDLES_TABLE,
            schema::CREATE_ANALYTICS_METRICS_TABLE,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to create table")?;
        }

        for ddl in schema::CREATE_INDICES {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        // Check if the extension is available
        let res = sqlx::query("SELECT COUNT(*) FROM pg_extension WHERE extname = 'timescaledb'")
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = res.get(0);

        if count > 0 {
            for (table, time_column) in schema::HYPERTABLES {
                let res = sqlx::query(&format!(
                    "SELECT create_hypertable('{}', '{}', if_not_exists => TRUE, migrate_data => TRUE)",
                    table, time_column
                ))
                .execute(&self.pool)
                .await;

                if let Err(e) = res {
                    // If it fails because the table is already a hypertable, that's fine
                    if !e.to_string().contains("already a hypertable") {
                        return Err(e.into());
                    }
                }
            }
            info!("Candles and metrics converted to TimescaleDB hypertables");
        } else {
            info!("TimescaleDB extension not available, skipping hypertable creation");
        }

        self.seed_timeframes().await?;

        info!("Database schema initialized");
        Ok(())
    }

    // Insert a row for every timeframe no existing label already resolves to
    async fn seed_timeframes(&self) -> Result<()> {
        let existing: HashSet<Timeframe> = self
            .timeframes()
            .await?
            .iter()
            .filter_map(|record| record.resolve().ok())
            .collect();

        let column = self.label_column().await?;
        let mut tx = self.pool.begin().await?;
        let mut seeded = 0;
        for tf in Timeframe::ALL.iter().filter(|tf| !existing.contains(tf)) {
            sqlx::query(&format!(
                "INSERT INTO timeframes ({}, seconds) VALUES ($1, $2)",
                column
            ))
            .bind(tf.code())
            .bind(tf.seconds() as i32)
            .execute(&mut *tx)
            .await?;
            seeded += 1;
        }
        tx.commit().await?;

        if seeded > 0 {
            info!("Seeded {} timeframe rows", seeded);
        }
        Ok(())
    }

    async fn label_column(&self) -> StoreResult<&'static str> {
        self.label_column
            .get_or_try_init(|| async {
                let rows = sqlx::query(
                    "SELECT column_name::TEXT FROM information_schema.columns
                     WHERE table_name = 'timeframes' AND column_name = ANY($1)",
                )
                .bind(
                    schema::TIMEFRAME_LABEL_COLUMNS
                        .iter()
                        .map(|c| c.to_string())
                        .collect::<Vec<_>>(),
                )
                .fetch_all(&self.pool)
                .await?;

                let present: Vec<String> = rows.iter().map(|r| r.get::<String, _>(0)).collect();
                let column = schema::TIMEFRAME_LABEL_COLUMNS
                    .iter()
                    .copied()
                    .find(|candidate| present.iter().any(|p| p == candidate))
                    .ok_or(StoreError::MissingLabelColumn(schema::TIMEFRAME_LABEL_COLUMNS))?;

                debug!("Using timeframes.{} as the timeframe label column", column);
                Ok::<_, StoreError>(column)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl CandleStore for PostgresManager {
    async fn last_candle_time(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT MAX(candle_time) FROM candles WHERE instrument_id = $1 AND timeframe_id = $2",
        )
        .bind(instrument_id)
        .bind(timeframe_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<Option<DateTime<Utc>>, _>(0)?)
    }

    async fn upsert_candles(&self, instrument_id: i32, timeframe_id: i32, rows: &[Candle]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        // A failed row aborts the whole batch; dropping the transaction rolls it back
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for candle in rows {
            let result = sqlx::query(
                "INSERT INTO candles
                 (instrument_id, timeframe_id, candle_time, open, high, low, close, volume)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (instrument_id, timeframe_id, candle_time) DO NOTHING",
            )
            .bind(instrument_id)
            .bind(timeframe_id)
            .bind(candle.candle_time)
            .bind(candle.open)
            .bind(candle.high)
            .bind(candle.low)
            .bind(candle.close)
            .bind(candle.volume)
            .execute(&mut *tx)
            .await;

            match result {
                Ok(done) => inserted += done.rows_affected(),
                Err(e) => {
                    error!(
                        "Failed to insert candle {} for instrument {} timeframe {}: {}",
                        candle.candle_time, instrument_id, timeframe_id, e
                    );
                    return Err(e.into());
                }
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_candles(&self, instrument_id: i32, timeframe_id: i32) -> StoreResult<Vec<Candle>> {
        let candles = sqlx::query_as::<_, Candle>(
            "SELECT candle_time, open, high, low, close, volume
             FROM candles
             WHERE instrument_id = $1 AND timeframe_id = $2
             ORDER BY candle_time ASC",
        )
        .bind(instrument_id)
        .bind(timeframe_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(candles)
    }
}

#[async_trait]
impl MetricStore for PostgresManager {
    async fn upsert_metrics(&self, batch: &MetricBatch) -> StoreResult<u64> {
        if batch.points.is_empty() {
            return Ok(0);
        }

        let key = &batch.key;
        let mut tx = self.pool.begin().await?;

        for point in &batch.points {
            let result = sqlx::query(
                "INSERT INTO analytics_metrics
                 (instrument_id, timeframe_id, metric_type, metric_window, metric_displacement, metric_timestamp, value)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (instrument_id, timeframe_id, metric_type, metric_window, metric_displacement, metric_timestamp)
                 DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
            )
            .bind(key.instrument_id)
            .bind(key.timeframe_id)
            .bind(&key.metric_type)
            .bind(key.window)
            .bind(key.displacement)
            .bind(point.metric_timestamp)
            .bind(point.value)
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                error!("Failed to upsert {} at {}: {}", key.metric_type, point.metric_timestamp, e);
                return Err(e.into());
            }
        }

        tx.commit().await?;
        Ok(batch.points.len() as u64)
    }

    async fn metric_series(&self, key: &MetricKey) -> StoreResult<Vec<MetricPoint>> {
        let points = sqlx::query_as::<_, MetricPoint>(
            "SELECT metric_timestamp, value
             FROM analytics_metrics
             WHERE instrument_id = $1 AND timeframe_id = $2 AND metric_type = $3
               AND metric_window = $4 AND metric_displacement = $5
             ORDER BY metric_timestamp ASC",
        )
        .bind(key.instrument_id)
        .bind(key.timeframe_id)
        .bind(&key.metric_type)
        .bind(key.window)
        .bind(key.displacement)
        .fetch_all(&self.pool)
        .await?;

        Ok(points)
    }
}

#[async_trait]
impl InstrumentRegistry for PostgresManager {
    async fn instruments(&self) -> StoreResult<Vec<Instrument>> {
        let instruments = sqlx::query_as::<_, Instrument>("SELECT id, symbol FROM instruments ORDER BY symbol")
            .fetch_all(&self.pool)
            .await?;
        Ok(instruments)
    }

    async fn timeframes(&self) -> StoreResult<Vec<TimeframeRecord>> {
        let column = self.label_column().await?;
        let records = sqlx::query_as::<_, TimeframeRecord>(&format!(
            "SELECT id, {}::TEXT AS label FROM timeframes ORDER BY id",
            column
        ))
        .fetch_all(&self.pool)
        .await?;

        for record in &records {
            if record.resolve().is_err() {
                warn!("Timeframe row {} has unrecognised label '{}'", record.id, record.label);
            }
        }
        Ok(records)
    }

    async fn ensure_instrument(&self, symbol: &str) -> StoreResult<Instrument> {
        let instrument = sqlx::query_as::<_, Instrument>(
            "INSERT INTO instruments (symbol, name) VALUES ($1, $1)
             ON CONFLICT (symbol) DO UPDATE SET updated_at = instruments.updated_at
             RETURNING id, symbol",
        )
        .bind(symbol)
        .fetch_one(&self.pool)
        .await?;
        Ok(instrument)
    }
}
