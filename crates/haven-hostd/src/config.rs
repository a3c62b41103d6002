//! Configuration file management.
//!
//! The daemon reads `config.toml` from the data directory; a missing
//! file means defaults. Every field has a default so partial configs
//! stay valid across releases.

use std::path::PathBuf;
use std::time::Duration;

use haven_types::{Currency, HostSettings};
use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostdConfig {
    /// Network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Pricing advertised through price tables.
    #[serde(default)]
    pub pricing: PricingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Listen address for renter sessions.
    #[serde(default = "default_rhp_listen")]
    pub rhp_listen: String,
    /// Address announced to renters. Empty = the listen address.
    #[serde(default)]
    pub announce_address: String,
    /// Unix socket of the consensus daemon.
    #[serde(default = "default_consensus_socket")]
    pub consensus_socket: String,
    /// Seconds between chain tip polls.
    #[serde(default = "default_poll_interval")]
    pub chain_poll_secs: u64,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// Seconds between volume syncs.
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    /// Days an empty account survives unused before pruning.
    #[serde(default = "default_account_ttl")]
    pub account_ttl_days: u64,
}

/// Pricing configuration. Amounts are in base units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub accepting_contracts: bool,
    #[serde(default = "default_max_account_balance")]
    pub max_account_balance: u128,
    #[serde(default = "default_max_collateral")]
    pub max_collateral: u128,
    #[serde(default = "default_contract_price")]
    pub contract_price: u128,
    #[serde(default = "default_base_rpc_price")]
    pub base_rpc_price: u128,
    #[serde(default = "default_storage_price")]
    pub storage_price: u128,
    #[serde(default = "default_ingress_price")]
    pub ingress_price: u128,
    #[serde(default = "default_egress_price")]
    pub egress_price: u128,
    #[serde(default = "default_collateral_per_byte")]
    pub collateral_per_byte: u128,
    #[serde(default = "default_renew_contract_price")]
    pub renew_contract_price: u128,
    #[serde(default = "default_fund_account_price")]
    pub fund_account_price: u128,
    #[serde(default = "default_window_size")]
    pub window_size: u64,
    #[serde(default = "default_max_contract_duration")]
    pub max_contract_duration: u64,
    #[serde(default = "default_price_table_validity")]
    pub price_table_validity_secs: u64,
}

impl HostdConfig {
    /// Load the config from the data directory, or defaults if no file
    /// exists yet.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: HostdConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// Translate pricing into the settings the protocol layer consumes.
    pub fn host_settings(&self) -> HostSettings {
        let p = &self.pricing;
        HostSettings {
            announce_address: if self.network.announce_address.is_empty() {
                self.network.rhp_listen.clone()
            } else {
                self.network.announce_address.clone()
            },
            accepting_contracts: p.accepting_contracts,
            max_account_balance: Currency(p.max_account_balance),
            max_collateral: Currency(p.max_collateral),
            contract_price: Currency(p.contract_price),
            base_rpc_price: Currency(p.base_rpc_price),
            storage_price: Currency(p.storage_price),
            ingress_price: Currency(p.ingress_price),
            egress_price: Currency(p.egress_price),
            collateral_per_byte: Currency(p.collateral_per_byte),
            renew_contract_price: Currency(p.renew_contract_price),
            fund_account_price: Currency(p.fund_account_price),
            window_size: p.window_size,
            max_contract_duration: p.max_contract_duration,
            price_table_validity: Duration::from_secs(p.price_table_validity_secs),
        }
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("HAVEN_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    /// Platform default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("HAVEN_DATA_DIR") {
            return PathBuf::from(dir);
        }
        dirs_fallback().join("haven")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".local/share"))
                .unwrap_or_else(|_| PathBuf::from("."))
        })
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rhp_listen: default_rhp_listen(),
            announce_address: String::new(),
            consensus_socket: default_consensus_socket(),
            chain_poll_secs: default_poll_interval(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            sync_interval_secs: default_sync_interval(),
            account_ttl_days: default_account_ttl(),
        }
    }
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            accepting_contracts: false,
            max_account_balance: default_max_account_balance(),
            max_collateral: default_max_collateral(),
            contract_price: default_contract_price(),
            base_rpc_price: default_base_rpc_price(),
            storage_price: default_storage_price(),
            ingress_price: default_ingress_price(),
            egress_price: default_egress_price(),
            collateral_per_byte: default_collateral_per_byte(),
            renew_contract_price: default_renew_contract_price(),
            fund_account_price: default_fund_account_price(),
            window_size: default_window_size(),
            max_contract_duration: default_max_contract_duration(),
            price_table_validity_secs: default_price_table_validity(),
        }
    }
}

fn default_rhp_listen() -> String {
    "0.0.0.0:9982".to_string()
}

fn default_consensus_socket() -> String {
    "consensus.sock".to_string()
}

fn default_poll_interval() -> u64 {
    10
}

fn default_sync_interval() -> u64 {
    300
}

fn default_account_ttl() -> u64 {
    90
}

fn default_max_account_balance() -> u128 {
    Currency::coins(10).0
}

fn default_max_collateral() -> u128 {
    Currency::coins(1000).0
}

fn default_contract_price() -> u128 {
    200_000_000
}

fn default_base_rpc_price() -> u128 {
    100_000
}

fn default_storage_price() -> u128 {
    30
}

fn default_ingress_price() -> u128 {
    10
}

fn default_egress_price() -> u128 {
    50
}

fn default_collateral_per_byte() -> u128 {
    60
}

fn default_renew_contract_price() -> u128 {
    100_000_000
}

fn default_fund_account_price() -> u128 {
    100_000
}

fn default_window_size() -> u64 {
    144
}

fn default_max_contract_duration() -> u64 {
    4320
}

fn default_price_table_validity() -> u64 {
    30 * 60
}
