//! CLI argument parsing for sdlock.
//!
//! Uses clap derive macros for declarative argument definitions.
//! Implementations live in the `commands` module.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// sdlock: device locking and blocking protocol of a backup storage daemon.
///
/// Inspect a device configuration or run a simulated set of jobs contending
/// for one device while an operator mounts a volume.
#[derive(Parser, Debug)]
#[command(name = "sdlock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands for sdlock.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a configuration file.
    ///
    /// Prints every device with its effective timings.
    CheckConfig(CheckConfigArgs),

    /// List every block reason with its description.
    States,

    /// Run jobs against one device.
    ///
    /// Job 1 blocks the device and waits for the operator, who mounts a
    /// volume after `--mount-after` seconds. Job 2 waits for any device to be
    /// released; the rest queue on the device lock.
    Simulate(SimulateArgs),
}

/// Arguments for the `check-config` command.
#[derive(Parser, Debug)]
pub struct CheckConfigArgs {
    /// Path to the YAML configuration.
    pub path: PathBuf,
}

/// Arguments for the `simulate` command.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Path to the YAML configuration.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Device to use (default: first configured device).
    #[arg(short, long)]
    pub device: Option<String>,

    /// Number of jobs to run.
    #[arg(short, long, default_value_t = 3)]
    pub jobs: u32,

    /// Seconds before the operator mounts a volume.
    #[arg(long, default_value_t = 1.0)]
    pub mount_after: f64,

    /// Append device events to this NDJSON file (overrides `event_log`).
    #[arg(long)]
    pub events: Option<PathBuf>,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_states() {
        let cli = Cli::try_parse_from(["sdlock", "states"]).unwrap();
        assert!(matches!(cli.command, Command::States));
    }

    #[test]
    fn parse_check_config() {
        let cli = Cli::try_parse_from(["sdlock", "check-config", "sd.yaml"]).unwrap();
        if let Command::CheckConfig(args) = cli.command {
            assert_eq!(args.path, PathBuf::from("sd.yaml"));
        } else {
            panic!("Expected CheckConfig command");
        }
    }

    #[test]
    fn parse_simulate_defaults() {
        let cli = Cli::try_parse_from(["sdlock", "simulate", "--config", "sd.yaml"]).unwrap();
        if let Command::Simulate(args) = cli.command {
            assert_eq!(args.config, PathBuf::from("sd.yaml"));
            assert!(args.device.is_none());
            assert_eq!(args.jobs, 3);
            assert_eq!(args.mount_after, 1.0);
            assert!(args.events.is_none());
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn parse_simulate_full() {
        let cli = Cli::try_parse_from([
            "sdlock",
            "simulate",
            "-c",
            "sd.yaml",
            "--device",
            "Tape0",
            "--jobs",
            "5",
            "--mount-after",
            "0.25",
            "--events",
            "events.ndjson",
        ])
        .unwrap();
        if let Command::Simulate(args) = cli.command {
            assert_eq!(args.device.as_deref(), Some("Tape0"));
            assert_eq!(args.jobs, 5);
            assert_eq!(args.mount_after, 0.25);
            assert_eq!(args.events, Some(PathBuf::from("events.ndjson")));
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn simulate_requires_config() {
        assert!(Cli::try_parse_from(["sdlock", "simulate"]).is_err());
    }
}
