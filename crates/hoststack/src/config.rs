//! Stack configuration management
//!
//! Every table in the stack is sized once from this configuration and never
//! reallocated past its capacity; exhausting a table reports `MaxExceeded`
//! to the caller instead of growing.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Static capacities and timeouts for one stack instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackConfig {
    /// Host controllers one stack instance can register
    #[serde(default = "StackConfig::default_max_controllers")]
    pub max_controllers: usize,

    /// Simultaneously registered class drivers
    #[serde(default = "StackConfig::default_max_drivers")]
    pub max_drivers: usize,

    /// Configurations per device
    #[serde(default = "StackConfig::default_max_configurations")]
    pub max_configurations: usize,

    /// Interfaces per configuration
    #[serde(default = "StackConfig::default_max_interfaces")]
    pub max_interfaces: usize,

    /// Alternate settings per interface
    #[serde(default = "StackConfig::default_max_alt_settings")]
    pub max_alt_settings: usize,

    /// Endpoints per alternate setting
    #[serde(default = "StackConfig::default_max_endpoints")]
    pub max_endpoints: usize,

    /// Timeout for one serialized control transfer, in milliseconds
    #[serde(default = "StackConfig::default_control_timeout_ms")]
    pub control_timeout_ms: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_controllers: Self::default_max_controllers(),
            max_drivers: Self::default_max_drivers(),
            max_configurations: Self::default_max_configurations(),
            max_interfaces: Self::default_max_interfaces(),
            max_alt_settings: Self::default_max_alt_settings(),
            max_endpoints: Self::default_max_endpoints(),
            control_timeout_ms: Self::default_control_timeout_ms(),
        }
    }
}

impl StackConfig {
    fn default_max_controllers() -> usize {
        2
    }

    fn default_max_drivers() -> usize {
        16
    }

    fn default_max_configurations() -> usize {
        4
    }

    fn default_max_interfaces() -> usize {
        8
    }

    fn default_max_alt_settings() -> usize {
        8
    }

    fn default_max_endpoints() -> usize {
        16
    }

    fn default_control_timeout_ms() -> u64 {
        5000
    }

    /// Parse from a TOML string
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject capacities the stack cannot operate with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_controllers == 0 {
            return Err(ConfigError::Invalid(
                "max_controllers must be at least 1".into(),
            ));
        }
        if self.max_drivers == 0 {
            return Err(ConfigError::Invalid("max_drivers must be at least 1".into()));
        }
        if self.max_configurations == 0 || self.max_interfaces == 0 || self.max_alt_settings == 0 {
            return Err(ConfigError::Invalid(
                "per-device capacities must be at least 1".into(),
            ));
        }
        if self.control_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "control_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Control-transfer completion timeout
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}
