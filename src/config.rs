//! Per-chain configuration
//!
//! Loaded from a JSON file. Every section has defaults, so a file only needs
//! the values that differ, e.g. `{"symbol": "QTUM", "network": "qtum"}`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::address::AddressConfig;
use crate::core::amount::DEFAULT_DECIMALS;
use crate::wallet::selector::DEFAULT_MAX_INPUTS;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error("Unknown network preset: {0}")]
    UnknownNetwork(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Transaction building options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Largest input count per transaction; larger spends must be split
    pub max_inputs: usize,
    /// Signal opt-in replace-by-fee on every input
    pub enable_rbf: bool,
    pub locktime: u32,
    /// Decimal places of one coin
    pub decimals: u32,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            max_inputs: DEFAULT_MAX_INPUTS,
            enable_rbf: false,
            locktime: 0,
            decimals: DEFAULT_DECIMALS,
        }
    }
}

/// Block scanner options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub poll_interval_secs: u64,
    /// Concurrent transaction fetches per block
    pub worker_concurrency: usize,
    pub scan_mempool: bool,
    /// First height to scan when no cursor is stored; the chain tip if unset
    pub start_height: Option<u64>,
    /// Fork rollbacks allowed in one tick before yielding
    pub max_rollbacks_per_tick: usize,
    /// Drop retry records for transactions the node reports as unknown
    pub purge_unknown_transactions: bool,
    /// Block headers kept in the store for fork handling
    pub max_cached_headers: usize,
    pub data_dir: PathBuf,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            worker_concurrency: 15,
            scan_mempool: false,
            start_height: None,
            max_rollbacks_per_tick: 10,
            purge_unknown_transactions: true,
            max_cached_headers: 1000,
            data_dir: PathBuf::from(".wallet_data"),
        }
    }
}

/// Everything one chain needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Ticker, also used to name the scan store file
    pub symbol: String,
    /// Address preset name; fills `address` when that section is absent
    pub network: Option<String>,
    pub address: AddressConfig,
    pub wallet: WalletConfig,
    pub scanner: ScannerConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC".to_string(),
            network: None,
            address: AddressConfig::default(),
            wallet: WalletConfig::default(),
            scanner: ScannerConfig::default(),
        }
    }
}

impl ChainConfig {
    /// Default configuration for a preset network
    pub fn for_network(symbol: &str, network: &str) -> Result<Self, ConfigError> {
        let address = AddressConfig::preset(network)
            .ok_or_else(|| ConfigError::UnknownNetwork(network.to_string()))?;
        Ok(Self {
            symbol: symbol.to_string(),
            network: Some(network.to_string()),
            address,
            ..Default::default()
        })
    }

    /// Parse from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let raw: serde_json::Value = serde_json::from_str(json)?;
        let has_address = raw.get("address").is_some();
        let mut config: ChainConfig = serde_json::from_value(raw)?;

        if let (Some(network), false) = (config.network.clone(), has_address) {
            config.address = AddressConfig::preset(&network)
                .ok_or(ConfigError::UnknownNetwork(network))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.is_empty() {
            return Err(ConfigError::InvalidValue("symbol must not be empty".to_string()));
        }
        if self.scanner.worker_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.scanner.max_rollbacks_per_tick == 0 {
            return Err(ConfigError::InvalidValue(
                "max_rollbacks_per_tick must be at least 1".to_string(),
            ));
        }
        if self.wallet.max_inputs == 0 {
            return Err(ConfigError::InvalidValue("max_inputs must be at least 1".to_string()));
        }
        if self.wallet.decimals > 18 {
            return Err(ConfigError::InvalidValue(format!(
                "decimals {} exceeds 18",
                self.wallet.decimals
            )));
        }
        Ok(())
    }

    /// Path of the JSON scan store for this chain
    pub fn store_path(&self) -> PathBuf {
        self.scanner
            .data_dir
            .join(format!("{}_scan.json", self.symbol.to_lowercase()))
    }
}
