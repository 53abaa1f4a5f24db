//! sdlock: device locking and blocking for a backup storage daemon.
//!
//! Many job threads share a small number of storage devices. Each device is
//! guarded by a short-held recursive lock and a longer-lived logical block
//! (see [`device`]). Jobs attach to devices through a
//! [`device::DeviceHandle`], wait for the operator with
//! [`device::DeviceHandle::wait_for_sysop`], and wait for any device to be
//! released through the [`coordinator::Coordinator`].

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod job;

#[cfg(test)]
mod test_support;

pub use coordinator::Coordinator;
pub use device::{BlockedState, Device, DeviceHandle, WaitStatus};
pub use error::{Result, SdError};
