//! Session configuration.
//!
//! All timeouts are tunables with defaults matching field-tested values, not
//! protocol constants. Loadable from TOML so a host app can ship overrides.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Tunables for the log fetch session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Time allowed for the connection to come up.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after a connect timeout.
    pub connect_retries: u32,
    /// Delay before a reconnect attempt.
    pub retry_delay_ms: u64,
    /// Inactivity window for each protocol step once connected.
    pub work_timeout_ms: u64,
    /// Settle time after discovery before touching the GATT table; bonded
    /// peers may push a service-changed indication right after discovery.
    pub discover_grace_ms: u64,
    /// Settle time after enabling notifications before the first request.
    pub subscribe_settle_ms: u64,
    /// Reply batches requested per read, each carrying up to 19 bytes.
    pub batch_factor: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 20_000,
            connect_retries: 1,
            retry_delay_ms: 1_000,
            work_timeout_ms: 5_000,
            discover_grace_ms: 1_600,
            subscribe_settle_ms: 1_000,
            batch_factor: 4,
        }
    }
}

/// Tunables for the pairing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// Scan window for finding the advertising device.
    pub scan_timeout_ms: u64,
    /// Time allowed for each connect attempt.
    pub connect_timeout_ms: u64,
    /// Reconnect attempts after a failed or timed-out connect.
    pub pair_retries: u32,
    /// Delay before a reconnect attempt.
    pub retry_delay_ms: u64,
    /// Interval between bond-state polls while waiting for bonding.
    pub check_interval_ms: u64,
    /// Bond-state polls before giving up.
    pub pair_checks: u32,
    /// Delay after discovery before requesting the bond, letting the
    /// platform finish its own security exchange first.
    pub bond_grace_ms: u64,
    /// Time to wait for the disconnect to complete after pairing.
    pub disconnect_wait_ms: u64,
    /// Delay before reporting the final result to the observer.
    pub result_settle_ms: u64,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 15_000,
            connect_timeout_ms: 20_000,
            pair_retries: 4,
            retry_delay_ms: 1_000,
            check_interval_ms: 2_000,
            pair_checks: 15,
            bond_grace_ms: 1_500,
            disconnect_wait_ms: 6_000,
            result_settle_ms: 300,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub pair: PairConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
