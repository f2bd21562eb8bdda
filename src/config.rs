//! Node Configuration using Figment
//!
//! Strongly-typed configuration for one collection node. Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/node.toml` by default)
//! 2. environment variables prefixed with `IMU_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use imu_daq::config::NodeConfig;
//!
//! let config = NodeConfig::load()?;
//! config.validate()?;
//! println!("Device: {}", config.device_id);
//! # Ok::<(), imu_daq::error::DaqError>(())
//! ```
//!
//! `IMU_DAQ_I2C__BUSES="[1, 3]"` overrides `i2c.buses`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::hardware::registers::{ALTERNATE_ADDRESS, DEFAULT_ADDRESS};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/node.toml";
/// Environment variable prefix.
pub const ENV_PREFIX: &str = "IMU_DAQ_";

/// Top-level node configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier; prefixes every sensor id
    pub device_id: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Bus topology to probe
    pub i2c: I2cConfig,
    /// Local storage locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Session hand-off destination
    #[serde(default)]
    pub transfer: TransferConfig,
}

/// Candidate bus locations; every (bus, address) pair is probed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct I2cConfig {
    /// Bus indices (`/dev/i2c-N`)
    pub buses: Vec<u8>,
    /// 7-bit device addresses
    #[serde(default = "default_addresses")]
    pub addresses: Vec<u8>,
}

/// Local storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Parent of temporary capture directories
    #[serde(default = "default_capture_dir")]
    pub capture_dir: PathBuf,
    /// Root scanned by the offline session tools
    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,
    /// Persisted per-sensor settings
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
}

/// Session hand-off configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Directory receiving session parts
    #[serde(default = "default_sessions_dir")]
    pub sessions_root: PathBuf,
    /// Prefix of the URLs announced for uploaded parts
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_addresses() -> Vec<u8> {
    vec![DEFAULT_ADDRESS, ALTERNATE_ADDRESS]
}

fn default_capture_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_settings_path() -> PathBuf {
    PathBuf::from("config/sensor_settings.toml")
}

fn default_base_url() -> String {
    "file://sessions".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            capture_dir: default_capture_dir(),
            sessions_dir: default_sessions_dir(),
            settings_path: default_settings_path(),
        }
    }
}

impl StorageConfig {
    /// Load only the `[storage]` section of a node configuration.
    ///
    /// The offline session tools need no bus topology, so a file without one (or no
    /// file at all) still yields the defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(NodeConfig::figment(path.as_ref())
            .focus("storage")
            .extract()?)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_dir(),
            base_url: default_base_url(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// Environment variables override file values, e.g.
    /// `IMU_DAQ_TRANSFER__BASE_URL=http://hub:8000/sessions`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Provider chain used by [`load_from`](Self::load_from).
    pub fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(invalid("device_id must not be empty"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.i2c.buses.is_empty() {
            return Err(invalid("i2c.buses must list at least one bus"));
        }
        if self.i2c.addresses.is_empty() {
            return Err(invalid("i2c.addresses must list at least one address"));
        }
        if let Some(address) = self
            .i2c
            .addresses
            .iter()
            .find(|a| !(0x03..=0x77).contains(*a))
        {
            return Err(invalid(format!(
                "Address {address:#04x} is outside the 7-bit range 0x03..=0x77"
            )));
        }

        let mut buses = HashSet::new();
        if let Some(bus) = self.i2c.buses.iter().find(|b| !buses.insert(**b)) {
            return Err(invalid(format!("Duplicate bus: {bus}")));
        }
        let mut addresses = HashSet::new();
        if let Some(address) = self.i2c.addresses.iter().find(|a| !addresses.insert(**a)) {
            return Err(invalid(format!("Duplicate address: {address:#04x}")));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DaqError {
    DaqError::Configuration(message.into())
}
