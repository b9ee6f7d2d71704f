//! Configuration for the application node

use chain_modules::{Address, DecCoins};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Minimum gas prices accepted into the mempool, e.g. `0.5aphoton`
    pub min_gas_prices: String,

    /// Assert every invariant each N blocks; 0 disables
    pub inv_check_period: u64,

    /// Stop after committing this height; 0 disables
    pub halt_height: u64,

    /// Maximum gas a single transaction may request; 0 means unlimited
    pub max_block_gas: u64,

    /// Heights at which scheduled upgrades are skipped
    pub skip_upgrade_heights: Vec<u64>,

    /// Account allowed to schedule and cancel upgrades (hex)
    pub upgrade_authority: Option<String>,

    /// JSON-lines trace of committed writes
    pub trace_file: Option<PathBuf>,

    /// Genesis document
    pub genesis_file: PathBuf,

    /// Interval between blocks produced by the solo block loop
    pub block_interval_ms: u64,

    /// Store configuration
    pub store: chain_store::Config,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_gas_prices: String::new(),
            inv_check_period: 0,
            halt_height: 0,
            max_block_gas: 0,
            skip_upgrade_heights: Vec::new(),
            upgrade_authority: None,
            trace_file: None,
            genesis_file: PathBuf::from("./config/genesis.json"),
            block_interval_ms: 1000,
            store: chain_store::Config::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(prices) = std::env::var("CHAIN_MIN_GAS_PRICES") {
            config.min_gas_prices = prices;
        }

        if let Ok(period) = std::env::var("CHAIN_INV_CHECK_PERIOD") {
            config.inv_check_period = parse_env("CHAIN_INV_CHECK_PERIOD", &period)?;
        }

        if let Ok(height) = std::env::var("CHAIN_HALT_HEIGHT") {
            config.halt_height = parse_env("CHAIN_HALT_HEIGHT", &height)?;
        }

        if let Ok(gas) = std::env::var("CHAIN_MAX_BLOCK_GAS") {
            config.max_block_gas = parse_env("CHAIN_MAX_BLOCK_GAS", &gas)?;
        }

        if let Ok(heights) = std::env::var("CHAIN_SKIP_UPGRADE_HEIGHTS") {
            config.skip_upgrade_heights = heights
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(|h| parse_env("CHAIN_SKIP_UPGRADE_HEIGHTS", h))
                .collect::<crate::Result<_>>()?;
        }

        if let Ok(authority) = std::env::var("CHAIN_UPGRADE_AUTHORITY") {
            config.upgrade_authority = Some(authority);
        }

        if let Ok(path) = std::env::var("CHAIN_TRACE_FILE") {
            config.trace_file = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("CHAIN_GENESIS_FILE") {
            config.genesis_file = PathBuf::from(path);
        }

        if let Ok(interval) = std::env::var("CHAIN_BLOCK_INTERVAL_MS") {
            config.block_interval_ms = parse_env("CHAIN_BLOCK_INTERVAL_MS", &interval)?;
        }

        if let Ok(dir) = std::env::var("CHAIN_DATA_DIR") {
            config.store.data_dir = PathBuf::from(dir);
        }

        if let Ok(keep) = std::env::var("CHAIN_PRUNING_KEEP_RECENT") {
            config.store.pruning.keep_recent = parse_env("CHAIN_PRUNING_KEEP_RECENT", &keep)?;
        }

        if let Ok(interval) = std::env::var("CHAIN_PRUNING_SNAPSHOT_INTERVAL") {
            config.store.pruning.snapshot_interval = parse_env("CHAIN_PRUNING_SNAPSHOT_INTERVAL", &interval)?;
        }

        if let Ok(level) = std::env::var("CHAIN_LOG_LEVEL") {
            config.logging.level = level;
        }

        if let Ok(json) = std::env::var("CHAIN_LOG_JSON") {
            config.logging.json = parse_env("CHAIN_LOG_JSON", &json)?;
        }

        Ok(config)
    }

    /// Parsed minimum gas prices
    pub fn min_gas_prices(&self) -> crate::Result<DecCoins> {
        if self.min_gas_prices.trim().is_empty() {
            return Ok(DecCoins::empty());
        }
        self.min_gas_prices
            .parse()
            .map_err(|e| crate::Error::Config(format!("Invalid min gas prices: {}", e)))
    }

    /// Parsed upgrade authority
    pub fn upgrade_authority(&self) -> crate::Result<Option<Address>> {
        self.upgrade_authority
            .as_deref()
            .map(|hex| {
                Address::from_hex(hex)
                    .map_err(|e| crate::Error::Config(format!("Invalid upgrade authority: {}", e)))
            })
            .transpose()
    }

    /// Skip heights as a set
    pub fn skip_heights(&self) -> BTreeSet<u64> {
        self.skip_upgrade_heights.iter().copied().collect()
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}
