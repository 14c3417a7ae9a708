//! Configuration for the treasury engine

use crate::types::PaymentMode;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Treasury configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Proposal/voting configuration
    pub governance: GovernanceConfig,

    /// Deposit gateway configuration
    pub payment: PaymentConfig,

    /// Outgoing transfer configuration
    pub payout: PayoutConfig,

    /// Deadline sweep configuration
    pub scheduler: SchedulerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/treasury"),
            service_name: "treasury-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            rocksdb: RocksDBConfig::default(),
            governance: GovernanceConfig::default(),
            payment: PaymentConfig::default(),
            payout: PayoutConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 3,
            max_background_jobs: 2,
            enable_statistics: false,
        }
    }
}

/// Governance configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Voting durations (hours) a proposer may choose from
    pub allowed_voting_hours: Vec<u32>,

    /// Duration used when the proposer does not choose one
    pub default_voting_hours: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            allowed_voting_hours: vec![1, 6, 12, 24, 48, 72, 168],
            default_voting_hours: 24,
        }
    }
}

/// Payment gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentConfig {
    /// Gateway server key. `None` runs in mock mode and disables
    /// callback signature checks.
    pub server_key: Option<String>,

    /// Override for the Snap API base URL (derived from the key otherwise)
    pub snap_base_url: Option<String>,

    /// Minimum deposit (minor units)
    pub min_amount: i64,

    /// Order id prefix
    pub order_prefix: String,

    /// HTTP timeout for gateway calls (seconds)
    pub request_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            server_key: None,
            snap_base_url: None,
            min_amount: 1_000,
            order_prefix: "MKG".to_string(),
            request_timeout_secs: 15,
        }
    }
}

impl PaymentConfig {
    /// Gateway mode implied by the configured key
    pub fn mode(&self) -> PaymentMode {
        match self.server_key.as_deref() {
            None | Some("") => PaymentMode::Mock,
            Some(key) if key.starts_with("Mid-server-") => PaymentMode::Production,
            Some(_) => PaymentMode::Sandbox,
        }
    }

    /// Snap API base URL for the current mode
    pub fn snap_base_url(&self) -> String {
        if let Some(url) = &self.snap_base_url {
            return url.trim_end_matches('/').to_string();
        }
        match self.mode() {
            PaymentMode::Production => "https://app.midtrans.com/snap/v1".to_string(),
            _ => "https://app.sandbox.midtrans.com/snap/v1".to_string(),
        }
    }
}

/// Payout (disbursement) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    /// Iris API key. `None` runs payouts in mock mode.
    pub api_key: Option<String>,

    /// Iris API base URL
    pub base_url: String,

    /// HTTP timeout for payout calls (seconds)
    pub request_timeout_secs: u64,
}

impl Default for PayoutConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://app.sandbox.midtrans.com/iris/api/v1".to_string(),
            request_timeout_secs: 15,
        }
    }
}

/// Deadline sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between sweeps
    pub sweep_interval_secs: u64,

    /// Run the periodic sweep
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            enabled: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("TREASURY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(key) = std::env::var("MIDTRANS_SERVER_KEY") {
            if !key.is_empty() {
                config.payment.server_key = Some(key);
            }
        }

        if let Ok(url) = std::env::var("MIDTRANS_SNAP_BASE_URL") {
            config.payment.snap_base_url = Some(url);
        }

        if let Ok(key) = std::env::var("MIDTRANS_IRIS_API_KEY") {
            if !key.is_empty() {
                config.payout.api_key = Some(key);
            }
        }

        if let Ok(url) = std::env::var("MIDTRANS_IRIS_BASE_URL") {
            config.payout.base_url = url;
        }

        if let Ok(secs) = std::env::var("TREASURY_SWEEP_INTERVAL_SECS") {
            config.scheduler.sweep_interval_secs = secs.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid TREASURY_SWEEP_INTERVAL_SECS: {}", e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.governance.allowed_voting_hours.is_empty() {
            return Err(crate::Error::Config(
                "allowed_voting_hours must not be empty".to_string(),
            ));
        }
        if !self
            .governance
            .allowed_voting_hours
            .contains(&self.governance.default_voting_hours)
        {
            return Err(crate::Error::Config(format!(
                "default_voting_hours {} is not an allowed duration",
                self.governance.default_voting_hours
            )));
        }
        if self.payment.min_amount <= 0 {
            return Err(crate::Error::Config(
                "min_amount must be positive".to_string(),
            ));
        }
        if self.scheduler.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
