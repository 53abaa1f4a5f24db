//! Process-wide device coordination.
//!
//! The [`Coordinator`] is built once at daemon startup from the configuration.
//! It owns every [`Device`], the shared event log, and the "any device
//! released" wait that jobs use when every device they could reserve is busy.

use crate::config::Config;
use crate::device::{Device, DeviceHandle};
use crate::error::{Result, SdError};
use crate::events::EventLog;
use crate::job::JobControl;
use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

/// A reservation notice goes to the operator every this many retries.
pub const RESERVE_NOTICE_EVERY: u32 = 5;

/// Owner of all devices and daemon-wide wait state.
#[derive(Debug)]
pub struct Coordinator {
    config: Config,
    devices: BTreeMap<String, Arc<Device>>,
    events: Arc<EventLog>,
    wait_ceiling: Duration,
    device_release_mutex: Mutex<()>,
    wait_device_release: Condvar,
}

impl Coordinator {
    /// Build devices from a validated configuration.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let events = Arc::new(EventLog::new());
        let devices = config
            .devices
            .iter()
            .map(|dc| {
                let device = Device::with_events(
                    dc.name.clone(),
                    dc.timing(config.heartbeat_interval),
                    Arc::clone(&events),
                );
                (dc.name.clone(), Arc::new(device))
            })
            .collect();

        Ok(Self {
            wait_ceiling: config.device_wait_ceiling(),
            config,
            devices,
            events,
            device_release_mutex: Mutex::new(()),
            wait_device_release: Condvar::new(),
        })
    }

    /// Override the device-free wait ceiling.
    pub fn with_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.wait_ceiling = ceiling;
        self
    }

    /// The configuration the coordinator was built from.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Event log shared by all devices.
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Look up a device by name.
    pub fn device(&self, name: &str) -> Result<Arc<Device>> {
        self.devices
            .get(name)
            .cloned()
            .ok_or_else(|| SdError::UserError(format!("unknown device '{}'", name)))
    }

    /// All devices, ordered by name.
    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    /// Attach a job to a device.
    pub fn attach(&self, device_name: &str, job: Arc<dyn JobControl>) -> Result<DeviceHandle> {
        let device = self.device(device_name)?;
        log::debug!("JobId={} attached to device '{}'", job.job_id(), device_name);
        Ok(DeviceHandle::new(device, job))
    }

    /// Detach a job from its device and wake jobs waiting for any device.
    ///
    /// A handle still holding the device lock is released first, with a
    /// warning. Must be called from the thread that locked it.
    pub fn detach(&self, handle: DeviceHandle) -> Result<()> {
        let released = handle.release_all();
        match &released {
            Ok(0) => {}
            Ok(depth) => log::warn!(
                "JobId={} detached from device '{}' while holding its lock (depth {}), released",
                handle.job().job_id(),
                handle.device().name(),
                depth
            ),
            Err(e) => log::warn!(
                "JobId={} could not release device '{}' on detach: {}",
                handle.job().job_id(),
                handle.device().name(),
                e
            ),
        }
        log::debug!(
            "JobId={} detached from device '{}'",
            handle.job().job_id(),
            handle.device().name()
        );
        drop(handle);
        self.notify_device_released();
        released.map(drop)
    }

    /// Sleep until some device is released or the ceiling passes.
    ///
    /// Every [`RESERVE_NOTICE_EVERY`]th retry tells the operator the job is
    /// still waiting. Always returns true: the caller rescans its devices
    /// either way. Wait failures are logged and otherwise ignored.
    pub fn wait_for_any_device_free(&self, job: &dyn JobControl, retries: &mut u32) -> bool {
        let guard = self
            .device_release_mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        *retries += 1;
        if *retries % RESERVE_NOTICE_EVERY == 0 {
            job.mount_message(&format!(
                "JobId={}, Job {} waiting to reserve a device.",
                job.job_id(),
                job.job_name()
            ));
        }

        match self.wait_device_release.wait_timeout(guard, self.wait_ceiling) {
            Ok((_, result)) if result.timed_out() => {
                log::trace!("JobId={}: device wait hit the ceiling", job.job_id());
            }
            Ok(_) => {
                log::trace!("JobId={}: woken by a device release", job.job_id());
            }
            Err(e) => {
                log::warn!("JobId={}: wait for device release failed: {}", job.job_id(), e);
            }
        }
        true
    }

    /// Wake every job waiting in [`Coordinator::wait_for_any_device_free`].
    pub fn notify_device_released(&self) {
        let _guard = self
            .device_release_mutex
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.wait_device_release.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::device::BlockedState;
    use crate::events::EventAction;
    use crate::job::JobRecord;
    use crate::test_support::test_job;
    use std::thread;
    use std::time::Instant;

    fn two_device_config() -> Config {
        let mut config = Config::default();
        config.heartbeat_interval = 20;
        let mut tape = DeviceConfig::new("Tape0");
        tape.volume_poll_interval = 300;
        config.devices.push(tape);
        config.devices.push(DeviceConfig::new("File0"));
        config
    }

    #[test]
    fn test_builds_devices_from_config() {
        let coordinator = Coordinator::new(two_device_config()).unwrap();

        let names: Vec<_> = coordinator.devices().map(|d| d.name().to_string()).collect();
        assert_eq!(names, vec!["File0", "Tape0"]);

        let tape = coordinator.device("Tape0").unwrap();
        assert_eq!(tape.timing().heartbeat_interval, Some(Duration::from_secs(20)));
        assert_eq!(tape.timing().volume_poll_interval, Some(Duration::from_secs(300)));
        assert_eq!(tape.remaining_wait(), Duration::from_secs(1800));
    }

    #[test]
    fn test_unknown_device_is_user_error() {
        let coordinator = Coordinator::new(two_device_config()).unwrap();
        let err = coordinator.device("Tape9").unwrap_err();
        assert!(matches!(err, SdError::UserError(_)));
        assert!(err.to_string().contains("Tape9"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = two_device_config();
        config.devices.push(DeviceConfig::new("Tape0"));
        assert!(matches!(
            Coordinator::new(config),
            Err(SdError::ConfigError(_))
        ));
    }

    #[test]
    fn test_devices_share_event_log() {
        let coordinator = Coordinator::new(two_device_config()).unwrap();
        coordinator.device("Tape0").unwrap().dblock(BlockedState::Despooling).unwrap();
        coordinator.device("File0").unwrap().dblock(BlockedState::Releasing).unwrap();

        let blocks = coordinator.events().with_action(EventAction::Block);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].device, "Tape0");
        assert_eq!(blocks[1].device, "File0");
    }

    #[test]
    fn test_wait_for_any_device_returns_at_ceiling() {
        let coordinator = Coordinator::new(two_device_config())
            .unwrap()
            .with_wait_ceiling(Duration::from_millis(200));
        let job = test_job(3);
        let mut retries = 0;

        let start = Instant::now();
        assert!(coordinator.wait_for_any_device_free(job.as_ref(), &mut retries));
        let elapsed = start.elapsed();

        assert_eq!(retries, 1);
        assert!(elapsed >= Duration::from_millis(150), "returned after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "returned after {:?}", elapsed);
    }

    #[test]
    fn test_wait_for_any_device_woken_by_release() {
        let coordinator = Arc::new(
            Coordinator::new(two_device_config())
                .unwrap()
                .with_wait_ceiling(Duration::from_secs(30)),
        );

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            thread::spawn(move || {
                let job = JobRecord::new(4, "backup");
                let mut retries = 0;
                let start = Instant::now();
                coordinator.wait_for_any_device_free(&job, &mut retries);
                start.elapsed()
            })
        };

        // Keep notifying until the waiter is parked and wakes up.
        while !waiter.is_finished() {
            thread::sleep(Duration::from_millis(20));
            coordinator.notify_device_released();
        }
        assert!(waiter.join().unwrap() < Duration::from_secs(10));
    }

    #[test]
    fn test_reservation_notice_every_fifth_retry() {
        let coordinator = Coordinator::new(two_device_config())
            .unwrap()
            .with_wait_ceiling(Duration::from_millis(1));
        let job = test_job(5);
        let mut retries = 0;

        for _ in 0..10 {
            coordinator.wait_for_any_device_free(job.as_ref(), &mut retries);
        }

        let messages = job.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], "JobId=5, Job job-5 waiting to reserve a device.");
    }

    #[test]
    fn test_attach_and_detach() {
        let coordinator = Coordinator::new(two_device_config()).unwrap();
        let job = test_job(6);

        let handle = coordinator.attach("File0", job.clone()).unwrap();
        assert_eq!(handle.device().name(), "File0");
        handle.m_lock(false).unwrap();
        handle.m_unlock().unwrap();
        coordinator.detach(handle).unwrap();

        assert!(coordinator.attach("Nope", job).is_err());
    }

    #[test]
    fn test_detach_releases_a_held_handle() {
        let coordinator = Coordinator::new(two_device_config()).unwrap();
        let job = test_job(7);

        let handle = coordinator.attach("Tape0", job).unwrap();
        handle.m_lock(false).unwrap();
        handle.m_lock(false).unwrap();
        let device = Arc::clone(handle.device());
        coordinator.detach(handle).unwrap();

        let status = device.status();
        assert!(status.holder.is_none());
        assert_eq!(status.recursion_count, 0);

        // Another thread can take the device right away.
        let taker = {
            let device = Arc::clone(&device);
            thread::spawn(move || {
                device.lock().unwrap();
                device.unlock().unwrap();
            })
        };
        taker.join().unwrap();
    }
}
