//! Device event log for sdlock.
//!
//! Every protocol transition that other parts of the daemon may need to audit
//! (blocks, unblocks, steals, sysop wait outcomes, operator requests, fatal
//! errors) is recorded as an [`Event`]. Events are kept in memory and can be
//! appended to an NDJSON file (one JSON object per line).
//!
//! # Event Format
//!
//! - `ts`: RFC3339 timestamp
//! - `action`: The transition recorded (block, unblock, steal, ...)
//! - `actor`: The daemon owner string (e.g., `bareos@HOST`)
//! - `device`: Device name
//! - `thread`: Thread that performed the transition
//! - `job`: Optional job id
//! - `details`: Freeform object with action-specific details

use crate::error::{Result, SdError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Transitions that are recorded as events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventAction {
    /// Device blocked by `dblock`.
    Block,
    /// Device unblocked by `dunblock`.
    Unblock,
    /// Block reason temporarily replaced.
    Steal,
    /// Stolen block state restored.
    GiveBack,
    /// A wait for the operator finished.
    SysopWait,
    /// Operator asked for a mount.
    MountRequest,
    /// Operator asked for an unmount.
    UnmountRequest,
    /// The device was poisoned.
    Fatal,
}

impl std::fmt::Display for EventAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventAction::Block => write!(f, "block"),
            EventAction::Unblock => write!(f, "unblock"),
            EventAction::Steal => write!(f, "steal"),
            EventAction::GiveBack => write!(f, "give_back"),
            EventAction::SysopWait => write!(f, "sysop_wait"),
            EventAction::MountRequest => write!(f, "mount_request"),
            EventAction::UnmountRequest => write!(f, "unmount_request"),
            EventAction::Fatal => write!(f, "fatal"),
        }
    }
}

/// An event record for the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// RFC3339 timestamp when the event occurred.
    pub ts: DateTime<Utc>,

    /// The transition that was performed.
    pub action: EventAction,

    /// The daemon owner string (e.g., `bareos@HOST`).
    pub actor: String,

    /// Device the transition applies to.
    pub device: String,

    /// Thread that performed the transition.
    pub thread: String,

    /// Optional job id for job-driven transitions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<u32>,

    /// Freeform details object with action-specific information.
    pub details: Value,
}

impl Event {
    /// Create a new event for the given device, stamped with the current
    /// time and the calling thread. The actor is filled in when the event is
    /// recorded.
    pub fn new(action: EventAction, device: impl Into<String>) -> Self {
        let current = std::thread::current();
        let thread = match current.name() {
            Some(name) => format!("{} ({:?})", name, current.id()),
            None => format!("{:?}", current.id()),
        };

        Self {
            ts: Utc::now(),
            action,
            actor: String::new(),
            device: device.into(),
            thread,
            job: None,
            details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Set the job id for this event.
    pub fn with_job(mut self, job_id: u32) -> Self {
        self.job = Some(job_id);
        self
    }

    /// Set the details object for this event.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Serialize the event to a single-line JSON string.
    pub fn to_ndjson_line(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| SdError::UserError(format!("failed to serialize event to JSON: {}", e)))
    }
}

/// Get the actor string for event metadata.
fn get_actor_string() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    format!("{}@{}", user, host)
}

/// Events kept in memory before the oldest are dropped.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

#[derive(Debug, Default)]
struct EventBuffer {
    events: VecDeque<Event>,
    dropped: u64,
}

/// In-memory event log shared by all devices of a daemon.
///
/// Holds at most `capacity` events; recording past that drops the oldest.
/// [`EventLog::append_to`] moves the buffered events to a file. Recording
/// never fails and never blocks on anything but the log's own mutex, so it is
/// safe to call while device bookkeeping is locked.
#[derive(Debug)]
pub struct EventLog {
    actor: String,
    capacity: usize,
    buffer: Mutex<EventBuffer>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Create an empty log holding up to [`DEFAULT_EVENT_CAPACITY`] events.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create an empty log holding up to `capacity` events (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            actor: get_actor_string(),
            capacity: capacity.max(1),
            buffer: Mutex::new(EventBuffer::default()),
        }
    }

    fn buffer(&self) -> MutexGuard<'_, EventBuffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event, stamping it with this log's actor.
    pub fn record(&self, mut event: Event) {
        log::trace!("event {} on {}: {}", event.action, event.device, event.details);
        if event.actor.is_empty() {
            event.actor.clone_from(&self.actor);
        }

        let mut buffer = self.buffer();
        buffer.events.push_back(event);
        self.trim(&mut buffer);
    }

    fn trim(&self, buffer: &mut EventBuffer) {
        while buffer.events.len() > self.capacity {
            buffer.events.pop_front();
            buffer.dropped += 1;
        }
    }

    /// Copy of the buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<Event> {
        self.buffer().events.iter().cloned().collect()
    }

    /// Buffered events with the given action.
    pub fn with_action(&self, action: EventAction) -> Vec<Event> {
        self.buffer()
            .events
            .iter()
            .filter(|e| e.action == action)
            .cloned()
            .collect()
    }

    /// Number of buffered events.
    pub fn len(&self) -> usize {
        self.buffer().events.len()
    }

    /// Whether no event is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.buffer().dropped
    }

    /// Move all buffered events to an NDJSON file.
    ///
    /// The file and its parent directory are created if they don't exist.
    /// Each event results in one line with a trailing newline. Written events
    /// leave the buffer; on failure they are put back. Returns the number of
    /// events written.
    pub fn append_to<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        let pending: Vec<Event> = self.buffer().events.drain(..).collect();

        match write_ndjson(path.as_ref(), &pending) {
            Ok(()) => Ok(pending.len()),
            Err(e) => {
                let mut buffer = self.buffer();
                for event in pending.into_iter().rev() {
                    buffer.events.push_front(event);
                }
                self.trim(&mut buffer);
                Err(e)
            }
        }
    }
}

fn write_ndjson(path: &Path, events: &[Event]) -> Result<()> {
    let mut lines = String::new();
    for event in events {
        lines.push_str(&event.to_ndjson_line()?);
        lines.push('\n');
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| {
            SdError::UserError(format!(
                "failed to create events directory '{}': {}",
                parent.display(),
                e
            ))
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| {
            SdError::UserError(format!(
                "failed to open events file '{}': {}",
                path.display(),
                e
            ))
        })?;

    file.write_all(lines.as_bytes()).map_err(|e| {
        SdError::UserError(format!(
            "failed to write events file '{}': {}",
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_event_creation() {
        let event = Event::new(EventAction::Block, "Tape0");

        assert_eq!(event.action, EventAction::Block);
        assert_eq!(event.device, "Tape0");
        assert!(event.actor.is_empty());
        assert!(!event.thread.is_empty());
        assert!(event.job.is_none());
        assert!(event.details.is_object());
    }

    #[test]
    fn test_event_builders() {
        let event = Event::new(EventAction::SysopWait, "Tape0")
            .with_job(42)
            .with_details(json!({"status": "mount"}));

        assert_eq!(event.job, Some(42));
        assert_eq!(event.details["status"], "mount");
    }

    #[test]
    fn test_ndjson_line_is_single_line() {
        let event = Event::new(EventAction::GiveBack, "Tape0")
            .with_details(json!({"restored": "waiting for operator action"}));
        let line = event.to_ndjson_line().unwrap();

        assert!(!line.contains('\n'));
        assert!(line.contains("\"action\":\"give_back\""));
        assert!(line.contains("\"device\":\"Tape0\""));
        // job is omitted when absent
        assert!(!line.contains("\"job\""));
    }

    #[test]
    fn test_action_display_matches_serde() {
        for action in [
            EventAction::Block,
            EventAction::Unblock,
            EventAction::Steal,
            EventAction::GiveBack,
            EventAction::SysopWait,
            EventAction::MountRequest,
            EventAction::UnmountRequest,
            EventAction::Fatal,
        ] {
            let serialized = serde_json::to_string(&action).unwrap();
            assert_eq!(serialized, format!("\"{}\"", action));
        }
    }

    #[test]
    fn test_log_records_and_filters() {
        let log = EventLog::new();
        assert!(log.is_empty());

        log.record(Event::new(EventAction::Block, "Tape0"));
        log.record(Event::new(EventAction::Unblock, "Tape0"));
        log.record(Event::new(EventAction::Block, "Tape1"));

        assert_eq!(log.len(), 3);
        assert_eq!(log.with_action(EventAction::Block).len(), 2);
        assert_eq!(log.snapshot()[1].action, EventAction::Unblock);
    }

    #[test]
    fn test_append_to_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("events").join("events.ndjson");

        let log = EventLog::new();
        log.record(Event::new(EventAction::Block, "Tape0"));
        log.record(Event::new(EventAction::Unblock, "Tape0"));
        assert_eq!(log.append_to(&path).unwrap(), 2);
        assert!(log.is_empty());

        log.record(Event::new(EventAction::Steal, "Tape0"));
        assert_eq!(log.append_to(&path).unwrap(), 1);
        assert_eq!(log.append_to(&path).unwrap(), 0);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        let parsed: Event = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.action, EventAction::Unblock);
        assert!(!parsed.actor.is_empty());
    }

    #[test]
    fn test_failed_append_keeps_events() {
        let temp_dir = TempDir::new().unwrap();
        // A directory where the file should be makes the open fail.
        let path = temp_dir.path().join("events.ndjson");
        std::fs::create_dir(&path).unwrap();

        let log = EventLog::new();
        log.record(Event::new(EventAction::Block, "Tape0"));
        assert!(log.append_to(&path).is_err());
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_log_is_bounded() {
        let log = EventLog::with_capacity(3);
        for _ in 0..5 {
            log.record(Event::new(EventAction::Block, "Tape0"));
        }
        log.record(Event::new(EventAction::Unblock, "Tape0"));

        assert_eq!(log.len(), 3);
        assert_eq!(log.dropped(), 3);
        assert_eq!(log.snapshot()[2].action, EventAction::Unblock);
    }

    #[test]
    fn test_recorded_events_carry_actor() {
        let log = EventLog::new();
        log.record(Event::new(EventAction::Block, "Tape0"));
        let event = &log.snapshot()[0];
        assert!(event.actor.contains('@'));
    }
}
