//! The device lock protocol: waiting locks, blocks, and lock stealing.

use super::{BlockedState, Device, Wakeup};
use crate::error::{Result, SdError};
use crate::events::{Event, EventAction};
use serde_json::json;
use std::thread::{self, ThreadId};

/// Block state taken over by [`Device::steal_lock`].
///
/// Must be handed back with [`Device::give_back_lock`], which consumes it.
/// Dropping it instead leaves the stolen reason in place and logs a warning.
#[must_use = "a stolen lock must be given back with Device::give_back_lock"]
#[derive(Debug)]
pub struct StolenLock {
    device: String,
    blocked: BlockedState,
    previous_blocked: BlockedState,
    owner: Option<ThreadId>,
    returned: bool,
}

impl StolenLock {
    /// Name of the device the lock was stolen from.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Block reason in effect before the steal.
    pub fn blocked(&self) -> BlockedState {
        self.blocked
    }

    /// Saved block reason in effect before the steal.
    pub fn previous_blocked(&self) -> BlockedState {
        self.previous_blocked
    }

    /// Thread that was exempt from the block before the steal.
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner
    }
}

impl Drop for StolenLock {
    fn drop(&mut self) {
        if !self.returned {
            log::warn!(
                "stolen lock on device '{}' dropped without being given back; {} was not restored",
                self.device,
                self.blocked
            );
        }
    }
}

impl Device {
    /// Lock the device and wait out any block set by another thread.
    ///
    /// With `already_locked` the caller asserts it holds the device lock and
    /// only the block check is done. The thread that set the block passes
    /// straight through. Returns with the device lock held, or with
    /// [`SdError::Poisoned`] and the lock released if the device is poisoned
    /// during the wait.
    #[track_caller]
    pub fn r_lock(&self, already_locked: bool) -> Result<()> {
        let mut state = if already_locked {
            self.require_holder(self.state()?, "r_lock")?
        } else {
            self.lock_state()?
        };

        let me = thread::current().id();

        if state.blocked.is_blocked() && state.no_wait_id != Some(me) {
            log::trace!(
                "{}: {:?} waits, device is {}",
                self.name(),
                me,
                state.blocked
            );
            state.num_waiting += 1;
            while state.blocked.is_blocked() {
                let (guard, wakeup) = self.park(state, &self.wait, None);
                state = guard;
                match wakeup {
                    Wakeup::Failed => {
                        state.num_waiting -= 1;
                        drop(state);
                        return Err(self.fatal("r_lock", "wait for the block to clear failed"));
                    }
                    Wakeup::Poisoned => {
                        state.num_waiting -= 1;
                        return Err(SdError::Poisoned(self.name().to_string()));
                    }
                    Wakeup::Signaled | Wakeup::TimedOut => {}
                }
            }
            state.num_waiting -= 1;
        }
        Ok(())
    }

    /// Release the device lock taken by [`Device::r_lock`]. The block state
    /// is left alone.
    #[track_caller]
    pub fn r_unlock(&self) -> Result<()> {
        self.unlock()
    }

    /// Block the device for `reason` and release the lock.
    ///
    /// The calling thread becomes the owner of the block and will not wait on
    /// it in later `r_lock` calls.
    #[track_caller]
    pub fn dblock(&self, reason: BlockedState) -> Result<()> {
        self.r_lock(false)?;
        let blocked = self.set_blocked(reason);
        let unlocked = self.r_unlock();
        blocked?;
        unlocked?;

        self.record(
            Event::new(EventAction::Block, self.name())
                .with_details(json!({ "reason": reason.as_str() })),
        );
        Ok(())
    }

    /// Clear the block and release the lock.
    ///
    /// With `already_locked` the caller asserts it holds the device lock.
    #[track_caller]
    pub fn dunblock(&self, already_locked: bool) -> Result<()> {
        if !already_locked {
            self.lock()?;
        }
        let cleared = self.clear_blocked();
        let unlocked = self.unlock();
        let cleared = cleared?;
        unlocked?;

        self.record(
            Event::new(EventAction::Unblock, self.name())
                .with_details(json!({ "cleared": cleared.as_str() })),
        );
        Ok(())
    }

    /// Take over the block with a new reason and release the lock.
    ///
    /// The caller must hold the device lock. The current block reason, saved
    /// reason, and owner are returned for [`Device::give_back_lock`]; the
    /// calling thread becomes the owner until then.
    #[track_caller]
    pub fn steal_lock(&self, reason: BlockedState) -> Result<StolenLock> {
        let mut state = self.require_holder(self.state()?, "steal_lock")?;

        let stolen = StolenLock {
            device: self.name().to_string(),
            blocked: state.blocked,
            previous_blocked: state.previous_blocked,
            owner: state.no_wait_id,
            returned: false,
        };
        state.blocked = reason;
        state.no_wait_id = Some(thread::current().id());
        drop(state);

        self.unlock()?;
        self.record(Event::new(EventAction::Steal, self.name()).with_details(json!({
            "from": stolen.blocked.as_str(),
            "to": reason.as_str(),
        })));
        Ok(stolen)
    }

    /// Lock the device and restore the block state saved by
    /// [`Device::steal_lock`].
    ///
    /// Returns with the device lock held; the caller unlocks it.
    #[track_caller]
    pub fn give_back_lock(&self, mut stolen: StolenLock) -> Result<()> {
        if stolen.device != self.name() {
            stolen.returned = true;
            let detail = format!("lock was stolen from device '{}'", stolen.device);
            return Err(self.fatal("give_back_lock", &detail));
        }

        let mut state = self.lock_state()?;
        let replaced = state.blocked;
        state.blocked = stolen.blocked;
        state.previous_blocked = stolen.previous_blocked;
        state.no_wait_id = stolen.owner;
        if state.num_waiting > 0 {
            self.wait.notify_all();
        }
        drop(state);

        stolen.returned = true;
        self.record(Event::new(EventAction::GiveBack, self.name()).with_details(json!({
            "from": replaced.as_str(),
            "restored": stolen.blocked.as_str(),
        })));
        Ok(())
    }

    /// Operator mount request.
    ///
    /// A job waiting for the operator is told a mount happened; an unmounted
    /// idle device is reopened. Returns whether anything changed.
    #[track_caller]
    pub fn request_mount(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        let before = state.blocked;
        let changed = match before {
            BlockedState::WaitingForSysop | BlockedState::UnmountedWaitingForSysop => {
                state.blocked = BlockedState::MountRequested;
                self.wait_next_vol.notify_all();
                true
            }
            BlockedState::Unmounted => {
                state.blocked = BlockedState::NotBlocked;
                state.no_wait_id = None;
                if state.num_waiting > 0 {
                    self.wait.notify_all();
                }
                self.wait_next_vol.notify_all();
                true
            }
            _ => false,
        };
        let after = state.blocked;
        drop(state);
        self.unlock()?;

        if changed {
            self.record(Event::new(EventAction::MountRequest, self.name()).with_details(json!({
                "from": before.as_str(),
                "to": after.as_str(),
            })));
        }
        Ok(changed)
    }

    /// Operator unmount request.
    ///
    /// An idle device becomes unmounted; a job waiting for the operator sees
    /// the device closed under it. Returns whether anything changed.
    #[track_caller]
    pub fn request_unmount(&self) -> Result<bool> {
        let mut state = self.lock_state()?;
        let before = state.blocked;
        let changed = match before {
            BlockedState::WaitingForSysop => {
                state.blocked = BlockedState::UnmountedWaitingForSysop;
                self.wait_next_vol.notify_all();
                true
            }
            BlockedState::NotBlocked => {
                state.blocked = BlockedState::Unmounted;
                state.no_wait_id = None;
                true
            }
            _ => false,
        };
        let after = state.blocked;
        drop(state);
        self.unlock()?;

        if changed {
            self.record(Event::new(EventAction::UnmountRequest, self.name()).with_details(json!({
                "from": before.as_str(),
                "to": after.as_str(),
            })));
        }
        Ok(changed)
    }

    /// Wake jobs waiting for the operator, e.g. after a volume was released.
    pub fn signal_next_volume(&self) -> Result<()> {
        let _state = self.state()?;
        self.wait_next_vol.notify_all();
        Ok(())
    }
}
