//! Storage device locking and blocking.
//!
//! A [`Device`] is guarded at two levels:
//!
//! - The **lock**: a short-held, recursive, per-thread lock over the device
//!   bookkeeping (`lock`/`unlock`). The holder may re-lock without deadlocking
//!   itself.
//! - The **block**: a logical flag ([`BlockedState`]) meaning one thread is
//!   doing a long exclusive operation (acquire, label, despool, waiting for the
//!   operator). The thread that set the block is exempt from waiting on it;
//!   everyone else sleeps in `r_lock` until it is cleared.
//!
//! While a lock holder sleeps on one of the device condition variables the
//! lock is released in full and re-acquired at the same depth on wake, the
//! same contract `pthread_cond_wait` gives its mutex.
//!
//! # Fatal errors
//!
//! Protocol violations (unlocking a lock the caller doesn't hold, blocking an
//! already blocked device, unbalanced `m_unlock`) and failures of the
//! underlying primitives return [`SdError::Fatal`] once and poison the device.
//! Every later operation returns [`SdError::Poisoned`], including threads
//! already sleeping on the device, which are woken. `unlock` still releases
//! the caller's level before reporting the poison, so a failed thread never
//! keeps the lock. Diagnostic reads keep working so the state can still be
//! reported.

mod blocked;
mod control;
mod handle;
mod sysop;


pub use blocked::BlockedState;
pub use control::StolenLock;
pub use handle::{DeviceHandle, HandleLockGuard, Volume};
pub use sysop::WaitStatus;

use crate::error::{Result, SdError};
use crate::events::{Event, EventAction, EventLog};
use serde_json::json;
use std::panic::Location;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

/// Timing values a device consumes from the daemon configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceTiming {
    /// Budget for one wait for the operator.
    pub max_wait: Duration,
    /// How often to give up an operator wait and poll for a volume.
    pub volume_poll_interval: Option<Duration>,
    /// How often to send heartbeats while waiting for the operator.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30 * 60),
            volume_poll_interval: None,
            heartbeat_interval: None,
        }
    }
}

/// Bookkeeping guarded by the device mutex.
#[derive(Debug)]
pub(crate) struct DeviceState {
    /// Thread holding the device lock.
    pub(crate) holder: Option<ThreadId>,
    /// Nested `lock` calls made by `holder`.
    pub(crate) recursion_count: u32,
    pub(crate) blocked: BlockedState,
    pub(crate) previous_blocked: BlockedState,
    /// Thread exempt from waiting while the device is blocked.
    pub(crate) no_wait_id: Option<ThreadId>,
    /// Threads parked in `r_lock` waiting for the block to clear.
    pub(crate) num_waiting: u32,
    pub(crate) remaining_wait: Duration,
    /// Set when an operator wait gave up to poll for a volume.
    pub(crate) poll: bool,
}

/// How a thread came back from parking on a device condition variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wakeup {
    Signaled,
    TimedOut,
    Failed,
    /// The device was poisoned. The caller no longer holds the device lock.
    Poisoned,
}

/// Point-in-time view of a device for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Device name.
    pub name: String,
    /// Current block reason.
    pub blocked: BlockedState,
    /// Block reason saved by the last transient override.
    pub previous_blocked: BlockedState,
    /// Thread exempt from the block.
    pub owner: Option<ThreadId>,
    /// Thread holding the device lock.
    pub holder: Option<ThreadId>,
    /// Lock depth of the holder.
    pub recursion_count: u32,
    /// Threads waiting for the block to clear.
    pub num_waiting: u32,
    /// What is left of the operator wait budget.
    pub remaining_wait: Duration,
    /// Whether a volume poll was requested.
    pub poll: bool,
    /// Whether a fatal error poisoned the device.
    pub poisoned: bool,
}

/// A shared storage device.
pub struct Device {
    name: String,
    timing: DeviceTiming,
    state: Mutex<DeviceState>,
    /// Signaled when the device lock is handed off.
    lock_released: Condvar,
    /// Signaled when the block is cleared or restored.
    pub(crate) wait: Condvar,
    /// Signaled on operator action or when a volume becomes available.
    pub(crate) wait_next_vol: Condvar,
    poisoned: AtomicBool,
    events: Arc<EventLog>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("timing", &self.timing)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device with its own event log.
    pub fn new(name: impl Into<String>, timing: DeviceTiming) -> Self {
        Self::with_events(name, timing, Arc::new(EventLog::new()))
    }

    /// Create a device that records into a shared event log.
    pub fn with_events(name: impl Into<String>, timing: DeviceTiming, events: Arc<EventLog>) -> Self {
        Self {
            name: name.into(),
            timing,
            state: Mutex::new(DeviceState {
                holder: None,
                recursion_count: 0,
                blocked: BlockedState::NotBlocked,
                previous_blocked: BlockedState::NotBlocked,
                no_wait_id: None,
                num_waiting: 0,
                remaining_wait: timing.max_wait,
                poll: false,
            }),
            lock_released: Condvar::new(),
            wait: Condvar::new(),
            wait_next_vol: Condvar::new(),
            poisoned: AtomicBool::new(false),
            events,
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timing values this device was configured with.
    pub fn timing(&self) -> DeviceTiming {
        self.timing
    }

    /// Event log this device records into.
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Whether a fatal error poisoned the device.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Acquire the device lock.
    ///
    /// Blocks until no other thread holds it. A thread that already holds the
    /// lock only increases its depth. Does not look at the block state; use
    /// [`Device::r_lock`] for that.
    ///
    /// Returns [`SdError::Poisoned`] instead of waiting forever if the device
    /// is poisoned while the caller waits.
    #[track_caller]
    pub fn lock(&self) -> Result<()> {
        self.lock_state().map(drop)
    }

    /// Release one level of the device lock.
    ///
    /// Fatal if the calling thread does not hold the lock. On a poisoned
    /// device the level is still released, then [`SdError::Poisoned`] is
    /// returned.
    #[track_caller]
    pub fn unlock(&self) -> Result<()> {
        let caller = Location::caller();
        let me = thread::current().id();
        let mut state = self.peek();

        if state.holder != Some(me) {
            drop(state);
            if self.is_poisoned() {
                return Err(SdError::Poisoned(self.name.clone()));
            }
            return Err(self.fatal("unlock", "device lock is not held by the calling thread"));
        }

        state.recursion_count -= 1;
        if state.recursion_count == 0 {
            state.holder = None;
            self.lock_released.notify_one();
        }
        log::trace!(
            "{}: unlock depth={} by {:?} at {}",
            self.name,
            state.recursion_count,
            me,
            caller
        );
        drop(state);

        if self.is_poisoned() {
            return Err(SdError::Poisoned(self.name.clone()));
        }
        Ok(())
    }

    /// Whether the calling thread holds the device lock.
    pub fn is_locked_by_current_thread(&self) -> bool {
        self.peek().holder == Some(thread::current().id())
    }

    /// Set the operator wait budget.
    pub fn set_remaining_wait(&self, remaining: Duration) -> Result<()> {
        self.state()?.remaining_wait = remaining;
        Ok(())
    }

    /// Reset the operator wait budget to the configured maximum.
    pub fn reset_remaining_wait(&self) -> Result<()> {
        self.set_remaining_wait(self.timing.max_wait)
    }

    /// What is left of the operator wait budget.
    pub fn remaining_wait(&self) -> Duration {
        self.peek().remaining_wait
    }

    /// Return and clear the volume poll request left by an operator wait.
    pub fn take_poll_request(&self) -> Result<bool> {
        let mut state = self.state()?;
        Ok(std::mem::take(&mut state.poll))
    }

    /// Snapshot the device bookkeeping.
    pub fn status(&self) -> DeviceStatus {
        let state = self.peek();
        DeviceStatus {
            name: self.name.clone(),
            blocked: state.blocked,
            previous_blocked: state.previous_blocked,
            owner: state.no_wait_id,
            holder: state.holder,
            recursion_count: state.recursion_count,
            num_waiting: state.num_waiting,
            remaining_wait: state.remaining_wait,
            poll: state.poll,
            poisoned: self.is_poisoned(),
        }
    }

    /// Bookkeeping for protocol operations. Refused once the device is poisoned.
    pub(crate) fn state(&self) -> Result<MutexGuard<'_, DeviceState>> {
        if self.is_poisoned() {
            return Err(SdError::Poisoned(self.name.clone()));
        }
        self.state.lock().map_err(|poison| {
            drop(poison);
            self.fatal("state", "bookkeeping mutex poisoned")
        })
    }

    /// Take the device lock and keep the bookkeeping guard, so nothing can
    /// happen between acquiring the lock and reading the state.
    #[track_caller]
    pub(crate) fn lock_state(&self) -> Result<MutexGuard<'_, DeviceState>> {
        let caller = Location::caller();
        let me = thread::current().id();
        let mut state = self.state()?;

        if state.holder == Some(me) {
            state.recursion_count += 1;
            log::trace!(
                "{}: relock depth={} by {:?} at {}",
                self.name,
                state.recursion_count,
                me,
                caller
            );
            return Ok(state);
        }

        loop {
            if self.is_poisoned() {
                drop(state);
                return Err(SdError::Poisoned(self.name.clone()));
            }
            if state.holder.is_none() {
                break;
            }
            state = match self.lock_released.wait(state) {
                Ok(guard) => guard,
                Err(poison) => {
                    drop(poison);
                    return Err(self.fatal(
                        "lock",
                        "bookkeeping mutex poisoned while waiting for the lock",
                    ));
                }
            };
        }
        state.holder = Some(me);
        state.recursion_count = 1;
        log::trace!("{}: lock by {:?} at {}", self.name, me, caller);
        Ok(state)
    }

    /// Bookkeeping for diagnostics. Works on a poisoned device.
    pub(crate) fn peek(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pass the guard through if the calling thread holds the device lock.
    #[track_caller]
    pub(crate) fn require_holder<'a>(
        &'a self,
        state: MutexGuard<'a, DeviceState>,
        operation: &str,
    ) -> Result<MutexGuard<'a, DeviceState>> {
        if state.holder == Some(thread::current().id()) {
            Ok(state)
        } else {
            drop(state);
            Err(self.fatal(operation, "device lock is not held by the calling thread"))
        }
    }

    /// Sleep on `condvar` with the device lock released.
    ///
    /// The caller must hold the device lock. It is released in full while
    /// sleeping and re-acquired at the same depth before returning, except
    /// on [`Wakeup::Poisoned`], where it stays released.
    pub(crate) fn park<'a>(
        &'a self,
        mut state: MutexGuard<'a, DeviceState>,
        condvar: &Condvar,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, DeviceState>, Wakeup) {
        let me = thread::current().id();
        let depth = state.recursion_count;
        state.holder = None;
        state.recursion_count = 0;
        self.lock_released.notify_one();
        if self.is_poisoned() {
            return (state, Wakeup::Poisoned);
        }

        let (mut state, mut wakeup) = match timeout {
            Some(timeout) => match condvar.wait_timeout(state, timeout) {
                Ok((guard, result)) if result.timed_out() => (guard, Wakeup::TimedOut),
                Ok((guard, _)) => (guard, Wakeup::Signaled),
                Err(poison) => (poison.into_inner().0, Wakeup::Failed),
            },
            None => match condvar.wait(state) {
                Ok(guard) => (guard, Wakeup::Signaled),
                Err(poison) => (poison.into_inner(), Wakeup::Failed),
            },
        };

        loop {
            if self.is_poisoned() {
                return (state, Wakeup::Poisoned);
            }
            if state.holder.is_none() {
                break;
            }
            state = match self.lock_released.wait(state) {
                Ok(guard) => guard,
                Err(poison) => {
                    wakeup = Wakeup::Failed;
                    poison.into_inner()
                }
            };
        }
        state.holder = Some(me);
        state.recursion_count = depth;
        (state, wakeup)
    }

    /// Log a fatal protocol error, poison the device, and build the error.
    ///
    /// Every thread sleeping on the device is woken and sees the poison. Must
    /// not be called with the bookkeeping guard held.
    #[track_caller]
    pub(crate) fn fatal(&self, operation: &str, detail: &str) -> SdError {
        let caller = Location::caller();
        let thread = thread::current().id();
        log::error!(
            "device {}: {} failed in {:?} at {}: {}",
            self.name,
            operation,
            thread,
            caller,
            detail
        );
        self.poisoned.store(true, Ordering::SeqCst);
        self.events.record(Event::new(EventAction::Fatal, &self.name).with_details(json!({
            "operation": operation,
            "detail": detail,
            "location": caller.to_string(),
        })));

        // Notify under the mutex so no waiter can miss the poison.
        let state = self.peek();
        self.lock_released.notify_all();
        self.wait.notify_all();
        self.wait_next_vol.notify_all();
        drop(state);

        SdError::Fatal(format!("device '{}': {}: {}", self.name, operation, detail))
    }

    pub(crate) fn record(&self, event: Event) {
        self.events.record(event);
    }
}
