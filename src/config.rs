// src/config.rs
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::indicators::DmaSpec;
use crate::sources::{BinanceSource, MarketDataSource, SourceChain};

pub const DEFAULT_CONFIG_FILE: &str = "candle-sync.toml";
pub const ENV_PREFIX: &str = "CANDLE_SYNC";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub scheduler: SchedulerSettings,
    pub sources: SourceSettings,
    pub dma: DmaSettings,
    pub backfill: BackfillSettings,
    pub daemon: DaemonSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub max_connections: u32,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "binanceuser".to_string(),
            password: "binancepass".to_string(),
            dbname: "binancedb".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub base_interval_secs: u64,
    pub inter_pair_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub symbol_cache_ttl_secs: u64,
    pub bootstrap_candles: usize,
    pub recompute_dma: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 60,
            inter_pair_delay_ms: 100,
            shutdown_timeout_secs: 5,
            symbol_cache_ttl_secs: 3600,
            bootstrap_candles: 100,
            recompute_dma: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Binance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    pub kind: SourceKind,
    pub base_url: String,
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,
}

fn default_source_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Priority order: earlier entries are asked first.
    pub chain: Vec<SourceEntry>,
    pub quote_asset: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            chain: vec![
                SourceEntry {
                    name: "binance".to_string(),
                    kind: SourceKind::Binance,
                    base_url: "https://api.binance.com".to_string(),
                    timeout_secs: default_source_timeout(),
                },
                SourceEntry {
                    name: "binance-vision".to_string(),
                    kind: SourceKind::Binance,
                    base_url: "https://data-api.binance.vision".to_string(),
                    timeout_secs: default_source_timeout(),
                },
            ],
            quote_asset: "USDT".to_string(),
        }
    }
}

impl SourceSettings {
    pub fn build_binance(&self, entry: &SourceEntry) -> Result<BinanceSource> {
        BinanceSource::new(
            &entry.name,
            &entry.base_url,
            &self.quote_asset,
            Duration::from_secs(entry.timeout_secs),
        )
        .with_context(|| format!("Failed to build source {}", entry.name))
    }

    pub fn build_chain(&self) -> Result<SourceChain> {
        let mut chain = SourceChain::default();
        for entry in &self.chain {
            let source: Arc<dyn MarketDataSource> = match entry.kind {
                SourceKind::Binance => Arc::new(self.build_binance(entry)?),
            };
            chain.push(source);
        }
        Ok(chain)
    }

    /// The first configured source also serves the tradable symbol listing.
    pub fn build_lister(&self) -> Result<Option<BinanceSource>> {
        self.chain
            .iter()
            .find(|e| e.kind == SourceKind::Binance)
            .map(|e| self.build_binance(e))
            .transpose()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DmaSettings {
    pub pairs: Vec<DmaSpec>,
    pub bulk_batch_size: usize,
}

impl Default for DmaSettings {
    fn default() -> Self {
        Self {
            pairs: crate::indicators::DEFAULT_DMA_SPECS.to_vec(),
            bulk_batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillSettings {
    pub concurrency: usize,
    pub days: i64,
}

impl Default for BackfillSettings {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    pub pid_file: String,
    pub log_file: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            pid_file: "/tmp/candle-sync.pid".to_string(),
            log_file: "/tmp/candle-sync.log".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file, then `CANDLE_SYNC__SECTION__KEY` variables.
    /// The plain `DB_*` variables are honoured for the database section.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .set_override_option("database.host", std::env::var("DB_HOST").ok())?
            .set_override_option("database.port", std::env::var("DB_PORT").ok())?
            .set_override_option("database.user", std::env::var("DB_USER").ok())?
            .set_override_option("database.password", std::env::var("DB_PASSWORD").ok())?
            .set_override_option("database.dbname", std::env::var("DB_NAME").ok())?
            .build()
            .context("Failed to read configuration")?;

        settings
            .try_deserialize::<Settings>()
            .context("Invalid configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.scheduler.base_interval_secs, 60);
        assert_eq!(settings.scheduler.symbol_cache_ttl_secs, 3600);
        assert_eq!(settings.scheduler.shutdown_timeout_secs, 5);
        assert_eq!(settings.sources.quote_asset, "USDT");
        assert_eq!(settings.dma.pairs.len(), 3);
        assert_eq!(settings.dma.pairs[2], DmaSpec::new(25, 5));
        assert!(settings.backfill.concurrency >= 1);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let raw = r#"
            [scheduler]
            inter_pair_delay_ms = 250

            [[sources.chain]]
            name = "primary"
            kind = "binance"
            base_url = "https://api.binance.com"

            [dma]
            pairs = [{ window = 5, displacement = 2 }]
        "#;
        let settings: Settings = Config::builder()
            .add_source(File::from_str(raw, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(settings.scheduler.inter_pair_delay_ms, 250);
        assert_eq!(settings.scheduler.base_interval_secs, 60);
        assert_eq!(settings.sources.chain.len(), 1);
        assert_eq!(settings.sources.chain[0].timeout_secs, 10);
        assert_eq!(settings.dma.pairs, vec![DmaSpec::new(5, 2)]);
        assert_eq!(settings.database.port, 5432);
    }

    #[test]
    fn builds_a_chain_in_configured_order() {
        let chain = SourceSettings::default().build_chain().unwrap();
        assert_eq!(chain.names(), vec!["binance", "binance-vision"]);
    }
}
