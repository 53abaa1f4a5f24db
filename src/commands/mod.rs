//! Command implementations for sdlock.
//!
//! This module provides the dispatcher that routes CLI commands to their
//! implementations. Each command sets up logging itself, since the log level
//! may come from the configuration it loads.

mod simulate;

use crate::cli::{CheckConfigArgs, Command};
use sdlock::config::{Config, LogLevel};
use sdlock::device::BlockedState;
use sdlock::error::Result;

/// Dispatch a command to its implementation.
pub fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::CheckConfig(args) => cmd_check_config(args),
        Command::States => cmd_states(),
        Command::Simulate(args) => simulate::cmd_simulate(args),
    }
}

/// Initialize the logger at `level` unless `RUST_LOG` says otherwise.
///
/// Later calls are ignored.
pub(crate) fn init_logging(level: LogLevel) {
    let _ = env_logger::Builder::new()
        .filter_level(level.to_filter())
        .parse_default_env()
        .try_init();
}

fn format_interval(secs: u64) -> String {
    if secs == 0 {
        "off".to_string()
    } else {
        format!("{}s", secs)
    }
}

fn cmd_check_config(args: CheckConfigArgs) -> Result<()> {
    let config = Config::load(&args.path)?;
    init_logging(config.log_level);

    println!(
        "{}: {} device(s), heartbeat {}, device wait ceiling {}s",
        args.path.display(),
        config.devices.len(),
        format_interval(config.heartbeat_interval),
        config.device_wait_ceiling
    );
    for device in &config.devices {
        println!(
            "  {:<16} max wait {}s, volume poll {}",
            device.name,
            device.max_wait,
            format_interval(device.volume_poll_interval)
        );
    }
    if let Some(path) = &config.event_log {
        println!("  events -> {}", path.display());
    }
    Ok(())
}

fn cmd_states() -> Result<()> {
    init_logging(LogLevel::default());

    for state in BlockedState::ALL {
        println!("{:<28} {}", state.as_str(), state.name());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_format_interval() {
        assert_eq!(format_interval(0), "off");
        assert_eq!(format_interval(45), "45s");
    }

    #[test]
    fn test_check_config_accepts_valid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sd.yaml");
        std::fs::write(&path, "devices:\n  - name: Tape0\n    volume_poll_interval: 60\n").unwrap();

        assert!(cmd_check_config(CheckConfigArgs { path }).is_ok());
    }

    #[test]
    fn test_check_config_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sd.yaml");
        std::fs::write(&path, "devices:\n  - name: Tape0\n  - name: Tape0\n").unwrap();

        let err = cmd_check_config(CheckConfigArgs { path }).unwrap_err();
        assert_eq!(err.exit_code(), sdlock::exit_codes::CONFIG_ERROR);
    }

    #[test]
    fn test_check_config_missing_file() {
        let args = CheckConfigArgs {
            path: PathBuf::from("/nonexistent/sd.yaml"),
        };
        assert!(cmd_check_config(args).is_err());
    }

    #[test]
    fn test_states_lists_all() {
        assert!(cmd_states().is_ok());
    }
}
