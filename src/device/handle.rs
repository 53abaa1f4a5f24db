//! Per-job device handles and their recursive lock.

use super::Device;
use crate::error::Result;
use crate::job::JobControl;
use std::sync::{Arc, Mutex, PoisonError};

/// Volume currently associated with a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Whether the job is actively using the volume.
    pub in_use: bool,
}

/// A job's attachment to a device.
///
/// Carries its own lock depth so the job can call code that locks the device
/// from inside a region that already holds it: only the outermost
/// [`DeviceHandle::m_lock`] touches the device, and only the matching
/// outermost [`DeviceHandle::m_unlock`] releases it.
pub struct DeviceHandle {
    device: Arc<Device>,
    job: Arc<dyn JobControl>,
    device_lock_depth: Mutex<u32>,
    volume: Mutex<Option<Volume>>,
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device", &self.device.name())
            .field("job", &self.job.job_id())
            .field("device_lock_depth", &self.lock_depth())
            .finish()
    }
}

impl DeviceHandle {
    /// Attach `job` to `device`.
    pub fn new(device: Arc<Device>, job: Arc<dyn JobControl>) -> Self {
        Self {
            device,
            job,
            device_lock_depth: Mutex::new(0),
            volume: Mutex::new(None),
        }
    }

    /// The device this handle is attached to.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The job owning this handle.
    pub fn job(&self) -> &dyn JobControl {
        self.job.as_ref()
    }

    /// Current handle lock depth.
    pub fn lock_depth(&self) -> u32 {
        *self
            .device_lock_depth
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the device through this handle.
    ///
    /// Nested calls only count. The outermost call goes through
    /// [`Device::r_lock`], so it waits out blocks set by other threads.
    #[track_caller]
    pub fn m_lock(&self, already_locked: bool) -> Result<()> {
        let mut depth = self
            .device_lock_depth
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *depth > 0 {
            *depth += 1;
            return Ok(());
        }

        self.device.r_lock(already_locked)?;
        *depth = 1;
        Ok(())
    }

    /// Undo one [`DeviceHandle::m_lock`].
    ///
    /// The device is unlocked when the depth returns to zero. Calling this
    /// at depth zero is fatal and poisons the device.
    #[track_caller]
    pub fn m_unlock(&self) -> Result<()> {
        let mut depth = self
            .device_lock_depth
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *depth == 0 {
            drop(depth);
            let detail = format!(
                "JobId={} unlocked a device handle that is not locked",
                self.job.job_id()
            );
            return Err(self.device.fatal("m_unlock", &detail));
        }

        *depth -= 1;
        if *depth == 0 {
            self.device.r_unlock()?;
        }
        Ok(())
    }

    /// Drop every level of the handle lock at once.
    ///
    /// Returns the depth that was released. The device is unlocked once if
    /// the handle held it.
    #[track_caller]
    pub fn release_all(&self) -> Result<u32> {
        let mut depth = self
            .device_lock_depth
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let released = std::mem::take(&mut *depth);
        if released > 0 {
            self.device.r_unlock()?;
        }
        Ok(released)
    }

    /// Lock through the handle and unlock when the guard is dropped.
    #[track_caller]
    pub fn lock_guard(&self) -> Result<HandleLockGuard<'_>> {
        self.m_lock(false)?;
        Ok(HandleLockGuard { handle: self })
    }

    /// Associate a volume with this handle. The volume starts in use.
    pub fn set_volume(&self, name: impl Into<String>) {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner) = Some(Volume {
            name: name.into(),
            in_use: true,
        });
    }

    /// The associated volume, if any.
    pub fn volume(&self) -> Option<Volume> {
        self.volume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mark the associated volume as not in use.
    pub(crate) fn release_volume(&self) {
        if let Some(volume) = self
            .volume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            volume.in_use = false;
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        let depth = self.lock_depth();
        if depth > 0 {
            log::warn!(
                "JobId={} detached from device '{}' with the device still locked (depth {})",
                self.job.job_id(),
                self.device.name(),
                depth
            );
        }
    }
}

/// RAII guard for a handle lock.
///
/// When dropped, the handle is unlocked once. If that fails, a warning is
/// logged but no panic occurs.
#[derive(Debug)]
pub struct HandleLockGuard<'a> {
    handle: &'a DeviceHandle,
}

impl HandleLockGuard<'_> {
    /// The handle this guard holds locked.
    pub fn handle(&self) -> &DeviceHandle {
        self.handle
    }
}

impl Drop for HandleLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.handle.m_unlock() {
            log::warn!(
                "failed to release device '{}': {}",
                self.handle.device.name(),
                e
            );
        }
    }
}
