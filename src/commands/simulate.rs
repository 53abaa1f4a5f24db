//! Implementation of the `sdlock simulate` command.
//!
//! Runs a handful of jobs against one configured device:
//!
//! 1. Job 1 blocks the device for an acquire, waits for the operator, labels
//!    the volume under a stolen block, then unblocks and detaches.
//! 2. Job 2 waits for any device to be released before locking.
//! 3. The remaining jobs take the handle lock twice and queue behind the
//!    block in `r_lock`.
//!
//! An operator thread mounts a volume once job 1 is waiting for it.

use crate::cli::SimulateArgs;
use crate::commands::init_logging;
use sdlock::config::Config;
use sdlock::coordinator::Coordinator;
use sdlock::device::{BlockedState, Device, DeviceHandle, WaitStatus};
use sdlock::error::{Result, SdError};
use sdlock::job::{JobControl, JobRecord};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long the operator keeps looking for a job waiting on the device.
const OPERATOR_PATIENCE: Duration = Duration::from_secs(30);

/// How long job 1 spends writing a label.
const LABEL_TIME: Duration = Duration::from_millis(50);

/// Upper bound on one "any device free" wait, so a missed release costs
/// little.
const RESCAN_CEILING: Duration = Duration::from_secs(1);

const POLL_STEP: Duration = Duration::from_millis(10);

/// What a job did, for the summary.
#[derive(Debug)]
struct JobOutcome {
    job_id: u32,
    summary: String,
    heartbeats: usize,
    messages: Vec<String>,
}

pub fn cmd_simulate(args: SimulateArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    init_logging(config.log_level);

    if args.jobs == 0 {
        return Err(SdError::UserError("--jobs must be at least 1".to_string()));
    }
    if !args.mount_after.is_finite() || args.mount_after < 0.0 {
        return Err(SdError::UserError(format!(
            "--mount-after must be a non-negative number of seconds, got {}",
            args.mount_after
        )));
    }

    let device_name = match &args.device {
        Some(name) => name.clone(),
        None => config
            .devices
            .first()
            .map(|d| d.name.clone())
            .ok_or_else(|| {
                SdError::UserError(format!(
                    "no devices configured in '{}'",
                    args.config.display()
                ))
            })?,
    };
    let events_path = args.events.clone().or_else(|| config.event_log.clone());

    let ceiling = config.device_wait_ceiling().min(RESCAN_CEILING);
    let coordinator = Arc::new(Coordinator::new(config)?.with_wait_ceiling(ceiling));
    let device = coordinator.device(&device_name)?;
    let mount_after = Duration::from_secs_f64(args.mount_after);

    log::info!(
        "simulating {} job(s) on device '{}', mount after {:?}",
        args.jobs,
        device_name,
        mount_after
    );

    let mut workers = Vec::new();
    let first = Arc::new(JobRecord::new(1, "job-1"));
    workers.push(spawn_job(&coordinator, &device_name, first, run_acquiring_job)?);

    // Let job 1 set its block before the others arrive.
    let start = Instant::now();
    while !device.is_blocked() && !workers[0].is_finished() && start.elapsed() < OPERATOR_PATIENCE
    {
        thread::sleep(POLL_STEP);
    }

    let operator = {
        let device = Arc::clone(&device);
        thread::Builder::new()
            .name("operator".to_string())
            .spawn(move || run_operator(&device, mount_after))
            .map_err(|e| SdError::UserError(format!("failed to start operator thread: {}", e)))?
    };

    for id in 2..=args.jobs {
        let job = Arc::new(JobRecord::new(id, format!("job-{}", id)));
        let worker = if id == 2 {
            spawn_job(&coordinator, &device_name, job, run_reserving_job)?
        } else {
            spawn_job(&coordinator, &device_name, job, run_queued_job)?
        };
        workers.push(worker);
    }

    let mut first_error = None;
    for worker in workers {
        match join(worker) {
            Ok(outcome) => print_outcome(&outcome),
            Err(e) => {
                eprintln!("job failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
    }
    match join(operator) {
        Ok(true) => println!("operator: mounted a volume on '{}'", device_name),
        Ok(false) => println!("operator: no job was waiting on '{}'", device_name),
        Err(e) => {
            eprintln!("operator failed: {}", e);
            first_error.get_or_insert(e);
        }
    }

    print_status(&device);

    if let Some(path) = events_path {
        let written = coordinator.events().append_to(&path)?;
        println!("{} event(s) appended to {}", written, path.display());
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

type JobBody = fn(&Coordinator, &DeviceHandle) -> Result<String>;

fn spawn_job(
    coordinator: &Arc<Coordinator>,
    device_name: &str,
    job: Arc<JobRecord>,
    body: JobBody,
) -> Result<JoinHandle<Result<JobOutcome>>> {
    let coordinator = Arc::clone(coordinator);
    let device_name = device_name.to_string();
    let name = job.job_name().to_string();

    thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let handle = coordinator.attach(&device_name, job.clone())?;
            let result = body(&coordinator, &handle);
            let detached = coordinator.detach(handle);
            let summary = result?;
            detached?;
            Ok(JobOutcome {
                job_id: job.job_id(),
                summary,
                heartbeats: job.heartbeats(),
                messages: job.messages(),
            })
        })
        .map_err(|e| SdError::UserError(format!("failed to start {}: {}", name, e)))
}

fn join<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    let name = handle.thread().name().unwrap_or("worker").to_string();
    handle
        .join()
        .map_err(|_| SdError::UserError(format!("{} panicked", name)))?
}

/// Block for an acquire, wait for a volume, label it, and unblock.
fn run_acquiring_job(_coordinator: &Coordinator, handle: &DeviceHandle) -> Result<String> {
    let device = handle.device();

    device.dblock(BlockedState::DoingAcquire)?;
    handle.set_volume("Full-0001");

    let status = handle.wait_for_sysop()?;
    if status != WaitStatus::Mount {
        device.dunblock(false)?;
        return Ok(format!("gave up waiting for the operator: {}", status));
    }

    device.lock()?;
    let stolen = device.steal_lock(BlockedState::WritingLabel)?;
    log::info!(
        "labeling volume on '{}' (was {})",
        device.name(),
        stolen.blocked()
    );
    thread::sleep(LABEL_TIME);
    device.give_back_lock(stolen)?;
    device.unlock()?;

    let guard = handle.lock_guard()?;
    device.dunblock(false)?;
    drop(guard);

    Ok(format!(
        "acquired {} after operator {}",
        handle.volume().map(|v| v.name).unwrap_or_default(),
        status
    ))
}

/// Wait for any device to be released, then lock this one.
fn run_reserving_job(coordinator: &Coordinator, handle: &DeviceHandle) -> Result<String> {
    let device = handle.device();
    let mut retries = 0;
    while device.is_blocked() {
        coordinator.wait_for_any_device_free(handle.job(), &mut retries);
    }

    handle.m_lock(false)?;
    handle.m_unlock()?;
    Ok(format!("reserved the device after {} retries", retries))
}

/// Take the handle lock twice, waiting out any block.
fn run_queued_job(_coordinator: &Coordinator, handle: &DeviceHandle) -> Result<String> {
    let start = Instant::now();
    handle.m_lock(false)?;
    handle.m_lock(false)?;
    let depth = handle.lock_depth();
    handle.m_unlock()?;
    handle.m_unlock()?;
    Ok(format!(
        "locked the device at depth {} after {:?}",
        depth,
        start.elapsed()
    ))
}

/// Mount a volume once a job is waiting for the operator.
fn run_operator(device: &Device, mount_after: Duration) -> Result<bool> {
    thread::sleep(mount_after);

    let start = Instant::now();
    while start.elapsed() < OPERATOR_PATIENCE {
        if device.blocked_state() == BlockedState::WaitingForSysop {
            return device.request_mount();
        }
        if !device.is_blocked() {
            return Ok(false);
        }
        thread::sleep(POLL_STEP);
    }
    Ok(false)
}

fn print_outcome(outcome: &JobOutcome) {
    println!("JobId={}: {}", outcome.job_id, outcome.summary);
    if outcome.heartbeats > 0 {
        println!("  heartbeats: {}", outcome.heartbeats);
    }
    for message in &outcome.messages {
        println!("  message: {}", message);
    }
}

fn print_status(device: &Device) {
    let status = device.status();
    println!(
        "device '{}': {}, remaining wait {}s, waiting {}{}",
        status.name,
        status.blocked.name(),
        status.remaining_wait.as_secs(),
        status.num_waiting,
        if status.poisoned { ", POISONED" } else { "" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("sd.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn args(config: PathBuf) -> SimulateArgs {
        SimulateArgs {
            config,
            device: None,
            jobs: 3,
            mount_after: 0.05,
            events: None,
        }
    }

    #[test]
    #[serial]
    fn test_simulate_runs_and_writes_events() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "devices:\n  - name: Tape0\n");
        let events = temp_dir.path().join("events.ndjson");

        let mut args = args(config);
        args.events = Some(events.clone());
        cmd_simulate(args).unwrap();

        let content = std::fs::read_to_string(&events).unwrap();
        assert!(content.contains("\"action\":\"block\""));
        assert!(content.contains("\"action\":\"mount_request\""));
        assert!(content.contains("\"action\":\"steal\""));
        assert!(content.contains("\"action\":\"give_back\""));
        assert!(content.contains("\"action\":\"unblock\""));
        assert!(!content.contains("\"action\":\"fatal\""));
    }

    #[test]
    #[serial]
    fn test_simulate_single_job() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "devices:\n  - name: Tape0\n");

        let mut args = args(config);
        args.jobs = 1;
        assert!(cmd_simulate(args).is_ok());
    }

    #[test]
    fn test_simulate_rejects_zero_jobs() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "devices:\n  - name: Tape0\n");

        let mut args = args(config);
        args.jobs = 0;
        let err = cmd_simulate(args).unwrap_err();
        assert!(matches!(err, SdError::UserError(_)));
    }

    #[test]
    fn test_simulate_rejects_negative_mount_delay() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "devices:\n  - name: Tape0\n");

        let mut args = args(config);
        args.mount_after = -1.0;
        assert!(cmd_simulate(args).is_err());
    }

    #[test]
    fn test_simulate_unknown_device() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "devices:\n  - name: Tape0\n");

        let mut args = args(config);
        args.device = Some("Tape9".to_string());
        let err = cmd_simulate(args).unwrap_err();
        assert_eq!(err.exit_code(), sdlock::exit_codes::USER_ERROR);
    }

    #[test]
    fn test_simulate_without_devices() {
        let temp_dir = TempDir::new().unwrap();
        let config = write_config(&temp_dir, "heartbeat_interval: 5\n");

        let err = cmd_simulate(args(config)).unwrap_err();
        assert!(err.to_string().contains("no devices"));
    }
}
