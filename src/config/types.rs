//! Configuration types and defaults for sdlock.
//!
//! This module defines the per-device section, the log level enum, and the
//! default value functions used by the Config struct.

use crate::device::DeviceTiming;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Verbosity of the daemon log.
///
/// `Trace` turns on per-call lock tracing with source locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Fatal lock errors only.
    Error,
    /// Errors plus recoverable anomalies (dropped stolen locks, failed guard releases).
    Warn,
    /// Operator-facing messages (default).
    #[default]
    Info,
    /// Heartbeats and wait outcomes.
    Debug,
    /// Every lock, unlock, block, and wakeup.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }

    /// The `log` filter matching this level.
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// One configured storage device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, unique within the daemon.
    pub name: String,

    /// Seconds a job may wait for the operator to mount a volume.
    #[serde(default = "default_max_wait")]
    pub max_wait: u64,

    /// Seconds between volume polls while waiting for the operator (0 disables).
    #[serde(default)]
    pub volume_poll_interval: u64,
}

impl DeviceConfig {
    /// Create a device section with default timings.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_wait: default_max_wait(),
            volume_poll_interval: 0,
        }
    }

    /// Convert the second-based settings into device timings.
    ///
    /// `heartbeat_interval` is the daemon-wide value in seconds (0 disables).
    pub fn timing(&self, heartbeat_interval: u64) -> DeviceTiming {
        DeviceTiming {
            max_wait: Duration::from_secs(self.max_wait),
            volume_poll_interval: non_zero_secs(self.volume_poll_interval),
            heartbeat_interval: non_zero_secs(heartbeat_interval),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

pub(crate) fn default_max_wait() -> u64 {
    30 * 60
}

pub(crate) fn default_device_wait_ceiling() -> u64 {
    60
}
