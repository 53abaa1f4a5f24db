//! Block reasons and the block state machine.

use super::Device;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::thread;

/// Why a device is blocked.
///
/// `NotBlocked` is both the initial and the idle state. Every other value
/// names the long-running operation that other threads must wait out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockedState {
    /// Idle.
    #[default]
    NotBlocked,
    /// The operator unmounted the device.
    Unmounted,
    /// A job is waiting for the operator to mount or label a volume.
    WaitingForSysop,
    /// A job is opening, validating, or positioning a volume.
    DoingAcquire,
    /// A volume label is being written.
    WritingLabel,
    /// The operator unmounted the device while a job was waiting for a mount.
    UnmountedWaitingForSysop,
    /// The operator asked for a mount.
    MountRequested,
    /// A spool file is being written to the device.
    Despooling,
    /// The device is being released.
    Releasing,
}

impl BlockedState {
    /// Every state, in declaration order.
    pub const ALL: [BlockedState; 9] = [
        BlockedState::NotBlocked,
        BlockedState::Unmounted,
        BlockedState::WaitingForSysop,
        BlockedState::DoingAcquire,
        BlockedState::WritingLabel,
        BlockedState::UnmountedWaitingForSysop,
        BlockedState::MountRequested,
        BlockedState::Despooling,
        BlockedState::Releasing,
    ];

    /// True for every state but `NotBlocked`.
    pub fn is_blocked(self) -> bool {
        self != BlockedState::NotBlocked
    }

    /// True when the operator has unmounted the device.
    pub fn is_unmounted(self) -> bool {
        matches!(
            self,
            BlockedState::Unmounted | BlockedState::UnmountedWaitingForSysop
        )
    }

    /// Stable identifier, as used in config and event details.
    pub fn as_str(self) -> &'static str {
        match self {
            BlockedState::NotBlocked => "not_blocked",
            BlockedState::Unmounted => "unmounted",
            BlockedState::WaitingForSysop => "waiting_for_sysop",
            BlockedState::DoingAcquire => "doing_acquire",
            BlockedState::WritingLabel => "writing_label",
            BlockedState::UnmountedWaitingForSysop => "unmounted_waiting_for_sysop",
            BlockedState::MountRequested => "mount_requested",
            BlockedState::Despooling => "despooling",
            BlockedState::Releasing => "releasing",
        }
    }

    /// Operator-facing description.
    pub fn name(self) -> &'static str {
        match self {
            BlockedState::NotBlocked => "not blocked",
            BlockedState::Unmounted => "user unmounted device",
            BlockedState::WaitingForSysop => "waiting for operator action",
            BlockedState::DoingAcquire => "opening, validating, or positioning tape",
            BlockedState::WritingLabel => "labeling tape",
            BlockedState::UnmountedWaitingForSysop => "closed by user during mount request",
            BlockedState::MountRequested => "mount request",
            BlockedState::Despooling => "despooling",
            BlockedState::Releasing => "releasing",
        }
    }
}

impl std::fmt::Display for BlockedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl Device {
    /// Block the device for `reason` on behalf of the calling thread.
    ///
    /// The caller must hold the device lock, the device must not be blocked,
    /// and `reason` must be a real block reason. Anything else is fatal.
    #[track_caller]
    pub fn set_blocked(&self, reason: BlockedState) -> Result<()> {
        let mut state = self.require_holder(self.state()?, "set_blocked")?;

        if !reason.is_blocked() {
            drop(state);
            return Err(self.fatal("set_blocked", "not_blocked is not a block reason"));
        }
        if state.blocked.is_blocked() {
            let detail = format!(
                "device is already blocked ({}), cannot block for {}",
                state.blocked, reason
            );
            drop(state);
            return Err(self.fatal("set_blocked", &detail));
        }

        state.blocked = reason;
        state.no_wait_id = Some(thread::current().id());
        Ok(())
    }

    /// Clear the block and wake every thread waiting for it.
    ///
    /// The caller must hold the device lock. Returns the state that was
    /// cleared.
    #[track_caller]
    pub fn clear_blocked(&self) -> Result<BlockedState> {
        let mut state = self.require_holder(self.state()?, "clear_blocked")?;

        let cleared = std::mem::take(&mut state.blocked);
        state.no_wait_id = None;
        if state.num_waiting > 0 {
            self.wait.notify_all();
        }
        Ok(cleared)
    }

    /// Whether the device is blocked.
    pub fn is_blocked(&self) -> bool {
        self.peek().blocked.is_blocked()
    }

    /// Current block reason.
    pub fn blocked_state(&self) -> BlockedState {
        self.peek().blocked
    }

    /// Operator-facing description of the current block reason.
    pub fn blocked_state_name(&self) -> &'static str {
        self.blocked_state().name()
    }

    /// Whether the operator has unmounted the device.
    pub fn is_unmounted(&self) -> bool {
        self.peek().blocked.is_unmounted()
    }
}
