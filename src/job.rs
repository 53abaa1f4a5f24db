//! Job collaborator seen by the locking core.
//!
//! The device protocol only needs four things from a job: its identity, a
//! polled cancellation flag, a way to send heartbeats on its connections, and
//! a sink for operator-facing mount messages.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// The parts of a job record the locking core talks to.
pub trait JobControl: Send + Sync {
    /// Numeric job id.
    fn job_id(&self) -> u32;

    /// Job name used in operator messages.
    fn job_name(&self) -> &str;

    /// Whether the job has been canceled. Polled, never pushed.
    fn is_canceled(&self) -> bool;

    /// Send a heartbeat on the job's file daemon and director connections.
    fn send_heartbeat(&self);

    /// Emit an operator-facing mount message.
    fn mount_message(&self, message: &str);
}

/// In-process job record.
///
/// Counts heartbeats and keeps mount messages so the CLI can report them.
#[derive(Debug)]
pub struct JobRecord {
    id: u32,
    name: String,
    canceled: AtomicBool,
    heartbeats: AtomicUsize,
    messages: Mutex<Vec<String>>,
}

impl JobRecord {
    /// Create a job record.
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            canceled: AtomicBool::new(false),
            heartbeats: AtomicUsize::new(0),
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Request cancellation. Waits notice it on their next wake.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    /// Number of heartbeats sent so far.
    pub fn heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Mount messages emitted so far.
    pub fn messages(&self) -> Vec<String> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl JobControl for JobRecord {
    fn job_id(&self) -> u32 {
        self.id
    }

    fn job_name(&self) -> &str {
        &self.name
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn send_heartbeat(&self) {
        let count = self.heartbeats.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("JobId={} heartbeat #{}", self.id, count);
    }

    fn mount_message(&self, message: &str) {
        log::info!("{}", message);
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_record_counts_heartbeats() {
        let job = JobRecord::new(7, "backup-client1");
        job.send_heartbeat();
        job.send_heartbeat();

        assert_eq!(job.job_id(), 7);
        assert_eq!(job.job_name(), "backup-client1");
        assert_eq!(job.heartbeats(), 2);
    }

    #[test]
    fn test_job_record_cancel() {
        let job = JobRecord::new(1, "restore");
        assert!(!job.is_canceled());
        job.cancel();
        assert!(job.is_canceled());
    }

    #[test]
    fn test_job_record_keeps_messages() {
        let job = JobRecord::new(1, "restore");
        job.mount_message("please mount volume Full-0001");
        assert_eq!(job.messages(), vec!["please mount volume Full-0001"]);
    }
}
