//! Waiting for the operator to mount or label a volume.

use super::{BlockedState, DeviceHandle, DeviceTiming, Wakeup};
use crate::error::{Result, SdError};
use crate::events::{Event, EventAction};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

/// How a wait for the operator ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStatus {
    /// Waiting on the device failed; the device state may be inconsistent.
    Error,
    /// The wait budget ran out.
    Timeout,
    /// The poll interval elapsed; the caller should check for a volume.
    Poll,
    /// The operator asked for a mount.
    Mount,
    /// Someone signaled the device (e.g. a volume was released).
    Wake,
    /// The job was canceled.
    Canceled,
}

impl WaitStatus {
    /// Stable identifier for logs and events.
    pub fn as_str(self) -> &'static str {
        match self {
            WaitStatus::Error => "error",
            WaitStatus::Timeout => "timeout",
            WaitStatus::Poll => "poll",
            WaitStatus::Mount => "mount",
            WaitStatus::Wake => "wake",
            WaitStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Longest single sleep: never past the remaining budget, the next heartbeat,
/// or (for a mounted device) the next volume poll.
pub(crate) fn wait_quantum(remaining: Duration, timing: &DeviceTiming, unmounted: bool) -> Duration {
    let mut quantum = remaining;
    if let Some(heartbeat) = timing.heartbeat_interval {
        quantum = quantum.min(heartbeat);
    }
    if !unmounted && let Some(poll) = timing.volume_poll_interval {
        quantum = quantum.min(poll);
    }
    quantum
}

impl DeviceHandle {
    /// Wait for the operator.
    ///
    /// Holds the device lock except while sleeping. Unless the operator has
    /// unmounted the device, the block reason is switched to
    /// `WaitingForSysop` for the duration of the wait and restored afterwards.
    /// Heartbeats go out on entry and then once per heartbeat interval.
    /// Cancellation is checked once per wake.
    ///
    /// A failed wait poisons the device and ends with [`WaitStatus::Error`].
    /// If another thread poisons the device during the wait,
    /// [`SdError::Poisoned`] is returned.
    pub fn wait_for_sysop(&self) -> Result<WaitStatus> {
        let device = self.device();
        let job = self.job();
        let timing = device.timing();

        self.release_volume();
        let mut state = device.lock_state()?;

        let mut unmounted = state.blocked.is_unmounted();
        let overridden = !unmounted;
        let mut add_wait = wait_quantum(state.remaining_wait, &timing, unmounted);
        if overridden {
            state.previous_blocked = state.blocked;
            state.blocked = BlockedState::WaitingForSysop;
        }

        let first_start = Instant::now();
        let mut last_heartbeat = first_start;
        if timing.heartbeat_interval.is_some() {
            job.send_heartbeat();
        }

        let mut status = WaitStatus::Canceled;
        while !job.is_canceled() {
            let start = Instant::now();
            let (guard, wakeup) = device.park(state, &device.wait_next_vol, Some(add_wait));
            state = guard;
            if wakeup == Wakeup::Poisoned {
                return Err(SdError::Poisoned(device.name().to_string()));
            }

            let now = Instant::now();
            let total_waited = now - first_start;
            state.remaining_wait = state.remaining_wait.saturating_sub(now - start);

            if let Some(interval) = timing.heartbeat_interval
                && now - last_heartbeat >= interval
            {
                job.send_heartbeat();
                last_heartbeat = now;
            }

            if wakeup == Wakeup::Failed {
                status = WaitStatus::Error;
                break;
            }

            // Labeling is operator driven and ends the wait some other way.
            if state.blocked == BlockedState::WritingLabel {
                continue;
            }

            if state.remaining_wait.is_zero() {
                status = WaitStatus::Timeout;
                break;
            }

            unmounted = state.blocked.is_unmounted();
            if !unmounted
                && timing
                    .volume_poll_interval
                    .is_some_and(|poll| total_waited >= poll)
            {
                state.poll = true;
                status = WaitStatus::Poll;
                break;
            }

            if state.blocked == BlockedState::MountRequested {
                status = WaitStatus::Mount;
                break;
            }

            if wakeup == Wakeup::Signaled {
                status = WaitStatus::Wake;
                break;
            }

            add_wait = wait_quantum(state.remaining_wait, &timing, unmounted);
        }

        let remaining = state.remaining_wait;
        if status == WaitStatus::Error {
            drop(state);
            let detail = format!("JobId={}: wait for the operator failed", job.job_id());
            device.fatal("wait_for_sysop", &detail);
            // Releases our level; the poison itself is reported by the status.
            if let Err(e) = device.unlock() {
                log::debug!("JobId={}: {}", job.job_id(), e);
            }
        } else {
            if overridden && !unmounted {
                state.blocked = state.previous_blocked;
            }
            drop(state);
            device.unlock()?;
        }

        log::debug!(
            "JobId={}: wait for operator on device '{}' ended: {}",
            job.job_id(),
            device.name(),
            status
        );
        device.record(
            Event::new(EventAction::SysopWait, device.name())
                .with_job(job.job_id())
                .with_details(json!({
                    "status": status.as_str(),
                    "waited_ms": saturating_millis(first_start.elapsed()),
                    "remaining_ms": saturating_millis(remaining),
                })),
        );
        Ok(status)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
