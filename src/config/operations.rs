//! Config loading, validation, and lookup operations.

use super::model::Config;
use super::types::DeviceConfig;
use crate::error::{Result, SdError};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

impl Config {
    /// Load config from a YAML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully loaded and validated config
    /// * `Err(SdError::ConfigError)` - Read error, parse error, or validation failure
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path).map_err(|e| {
            SdError::ConfigError(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse config from a YAML string.
    ///
    /// Unknown fields in the YAML are silently ignored for forward compatibility.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .map_err(|e| SdError::ConfigError(format!("failed to parse config YAML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize config to YAML string.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| SdError::ConfigError(format!("failed to serialize config to YAML: {}", e)))
    }

    /// Validate config values.
    ///
    /// Validation rules:
    /// - `device_wait_ceiling` must be positive
    /// - device names must be non-empty and unique
    pub fn validate(&self) -> Result<()> {
        if self.device_wait_ceiling == 0 {
            return Err(SdError::ConfigError(
                "device_wait_ceiling must be greater than 0".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for device in &self.devices {
            let name = device.name.trim();
            if name.is_empty() {
                return Err(SdError::ConfigError(
                    "device names must be non-empty".to_string(),
                ));
            }
            if !seen.insert(name) {
                return Err(SdError::ConfigError(format!(
                    "device '{}' is defined more than once",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Look up a device section by name.
    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// The device-free wait ceiling as a duration.
    pub fn device_wait_ceiling(&self) -> Duration {
        Duration::from_secs(self.device_wait_ceiling)
    }
}
