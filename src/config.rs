//! Process configuration. Preset loading and an interactive preset picker
//! are explicitly out of scope — this module only reads environment
//! variables and CLI flags, never a YAML/JSON preset file.
//!
//! A [`ConfigError`] here is always fatal and always surfaces before any
//! socket is opened, so the process exits non-zero before doing any work.

use std::collections::HashMap;
use std::time::Duration;

use thiserror::Error;

use crate::model::Channel;
use crate::writer::cache::CacheConfig;
use crate::writer::columnar::ColumnarConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
    #[error("preset has no symbols configured")]
    EmptyPreset,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: v }),
        Err(_) => Ok(default),
    }
}

/// Global process configuration: sink endpoints and the deployment flags
/// that choose which sinks run at all.
#[derive(Debug, Clone)]
pub struct Config {
    pub columnar: ColumnarConfig,
    pub cache: CacheConfig,
    pub enable_columnar: bool,
    pub enable_cache: bool,
    pub housekeep_interval_s: u64,
    pub ws_host: String,
    pub rest_host: String,
}

impl Config {
    /// Build from environment, falling back to the same defaults the
    /// writers themselves carry. `dotenv` has already been loaded by the
    /// caller.
    pub fn from_env() -> Result<Self, ConfigError> {
        let columnar = ColumnarConfig {
            url: env_or("COLUMNAR_URL", "http://localhost:8123"),
            database: env_or("COLUMNAR_DATABASE", "marketdata"),
            batch_rows: env_parse("COLUMNAR_BATCH_ROWS", 5_000usize)?,
            flush_interval_ms: env_parse("COLUMNAR_FLUSH_INTERVAL_MS", 250u64)?,
            compression: env_parse("COLUMNAR_COMPRESSION", true)?,
            request_timeout: Duration::from_secs(env_parse("COLUMNAR_TIMEOUT_S", 10u64)?),
        };
        let cache = CacheConfig {
            url: env_or("CACHE_URL", "redis://127.0.0.1/"),
            pipeline_size: env_parse("CACHE_PIPELINE_SIZE", 200usize)?,
            flush_interval_ms: env_parse("CACHE_FLUSH_INTERVAL_MS", 50u64)?,
            stream_maxlen: env_parse("CACHE_STREAM_MAXLEN", 1_000usize)?,
            command_timeout: Duration::from_secs(env_parse("CACHE_TIMEOUT_S", 3u64)?),
        };

        Ok(Self {
            columnar,
            cache,
            enable_columnar: env_parse("ENABLE_COLUMNAR", true)?,
            enable_cache: env_parse("ENABLE_CACHE", true)?,
            housekeep_interval_s: env_parse("HOUSEKEEP_INTERVAL_S", 30u64)?,
            ws_host: env_or("WS_HOST", "fstream.binance.com"),
            rest_host: env_or("REST_HOST", "fapi.binance.com"),
        })
    }
}

/// A single running preset: the channel set, symbol list, and per-channel
/// log cadence one supervisor process owns.
#[derive(Debug, Clone)]
pub struct Preset {
    pub label: String,
    pub symbols: Vec<String>,
    pub channels: Vec<Channel>,
    /// Explicit gate on the order-book diff channel (Open Question 2,
    /// see DESIGN.md): a preset must opt in, rather than the adapter
    /// inferring it from which other channels are enabled.
    pub enable_diff_orderbook: bool,
    pub cpu_affinity: Option<usize>,
    pub log_intervals: HashMap<Channel, Duration>,
}

impl Preset {
    /// Build a preset from CLI-supplied symbols and channel selection. No
    /// file format is parsed here — that loader is an explicit Non-goal.
    pub fn new(
        label: String,
        symbols: Vec<String>,
        channels: Vec<Channel>,
        enable_diff_orderbook: bool,
        cpu_affinity: Option<usize>,
    ) -> Result<Self, ConfigError> {
        if symbols.is_empty() {
            return Err(ConfigError::EmptyPreset);
        }
        Ok(Self {
            label,
            symbols,
            channels,
            enable_diff_orderbook,
            cpu_affinity,
            log_intervals: default_log_intervals(),
        })
    }
}

/// Default per-channel health log cadence: 5s for agg_trades_5s, 10s for
/// mark price / funding, 60s for klines; other channels fall back to the
/// mark/funding cadence.
fn default_log_intervals() -> HashMap<Channel, Duration> {
    let mut m = HashMap::new();
    m.insert(Channel::AggTrades5s, Duration::from_secs(5));
    m.insert(Channel::MarkPrice, Duration::from_secs(10));
    m.insert(Channel::Funding, Duration::from_secs(10));
    m.insert(Channel::Klines, Duration::from_secs(60));
    m.insert(Channel::Trades, Duration::from_secs(10));
    m.insert(Channel::L1, Duration::from_secs(10));
    m.insert(Channel::ObTop5, Duration::from_secs(10));
    m.insert(Channel::ObTop20, Duration::from_secs(10));
    m.insert(Channel::ObDiff, Duration::from_secs(10));
    m.insert(Channel::Liquidations, Duration::from_secs(10));
    m.insert(Channel::AdvancedMetrics, Duration::from_secs(10));
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preset_rejects_empty_symbol_list() {
        let result = Preset::new("test".into(), vec![], vec![Channel::Trades], false, None);
        assert!(matches!(result, Err(ConfigError::EmptyPreset)));
    }

    #[test]
    fn preset_carries_default_log_intervals() {
        let preset = Preset::new(
            "test".into(),
            vec!["BTCUSDT".into()],
            vec![Channel::Trades],
            false,
            Some(2),
        )
        .unwrap();
        assert_eq!(
            preset.log_intervals.get(&Channel::AggTrades5s),
            Some(&Duration::from_secs(5))
        );
        assert_eq!(preset.cpu_affinity, Some(2));
    }
}
