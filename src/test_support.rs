//! Shared helpers for unit tests.

use crate::device::{Device, DeviceHandle, DeviceTiming};
use crate::job::JobRecord;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A device with default timings.
pub(crate) fn test_device(name: &str) -> Arc<Device> {
    Arc::new(Device::new(name, DeviceTiming::default()))
}

/// A device whose operator wait budget, heartbeat, and poll interval are
/// given in milliseconds (`None` disables the interval).
pub(crate) fn timed_device(max_wait_ms: u64, heartbeat_ms: Option<u64>, poll_ms: Option<u64>) -> Arc<Device> {
    let timing = DeviceTiming {
        max_wait: Duration::from_millis(max_wait_ms),
        volume_poll_interval: poll_ms.map(Duration::from_millis),
        heartbeat_interval: heartbeat_ms.map(Duration::from_millis),
    };
    Arc::new(Device::new("Tape0", timing))
}

pub(crate) fn test_job(id: u32) -> Arc<JobRecord> {
    Arc::new(JobRecord::new(id, format!("job-{}", id)))
}

pub(crate) fn attach(device: &Arc<Device>, job: &Arc<JobRecord>) -> DeviceHandle {
    DeviceHandle::new(Arc::clone(device), job.clone())
}

/// Poll `condition` every few milliseconds until it holds or `timeout` passes.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
