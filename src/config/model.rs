//! Config struct definition and default implementation.

use super::types::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the storage daemon locking core.
///
/// Unknown fields in the YAML are ignored for forward compatibility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // =========================================================================
    // Daemon-wide timing
    // =========================================================================
    /// Seconds between heartbeats sent to a job's connections while it waits
    /// for the operator (0 disables).
    pub heartbeat_interval: u64,

    /// Upper bound in seconds for one wait for any device to be released.
    #[serde(default = "default_device_wait_ceiling")]
    pub device_wait_ceiling: u64,

    // =========================================================================
    // Logging
    // =========================================================================
    /// Log verbosity, overridden by `RUST_LOG` when set.
    pub log_level: LogLevel,

    /// NDJSON file that device events are appended to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_log: Option<PathBuf>,

    // =========================================================================
    // Devices
    // =========================================================================
    /// Configured devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            heartbeat_interval: 0,
            device_wait_ceiling: default_device_wait_ceiling(),
            log_level: LogLevel::default(),
            event_log: None,
            devices: Vec::new(),
        }
    }
}
