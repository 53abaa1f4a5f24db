//! Configuration model for sdlock.
//!
//! The locking core consumes configuration as plain data: device names,
//! mount-wait budgets, poll intervals, and the daemon-wide heartbeat interval.
//! YAML parsing is forward compatible (unknown fields are ignored) and values
//! are validated after parsing.

mod model;
mod operations;
pub mod types;


pub use model::Config;
pub use types::{DeviceConfig, LogLevel};
