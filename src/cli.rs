use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::DEFAULT_JOBS;

/// homebox - resumable post-install setup for a workstation
#[derive(Parser, Debug)]
#[command(name = "homebox")]
#[command(about = "Runs dependent setup steps once per host and resumes where it stopped")]
#[command(version)]
pub struct Cli {
    /// Steps file (defaults to $HOMEBOX_STEPS, then ./homebox.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub steps: Option<PathBuf>,

    /// Directory holding per-host state files
    /// (defaults to $HOMEBOX_STATE_DIR, then $XDG_STATE_HOME/homebox)
    #[arg(long, global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every pending step whose dependencies are satisfied
    Run {
        /// Host identifier (defaults to the system hostname)
        #[arg(long)]
        host: Option<String>,

        /// Only run these steps and what they depend on
        #[arg(long = "only", value_name = "STEP")]
        only: Vec<String>,

        /// Attempt failed steps again
        #[arg(long)]
        retry_failed: bool,

        /// Maximum number of steps running at once
        #[arg(short, long, default_value_t = DEFAULT_JOBS, value_parser = parse_jobs)]
        jobs: usize,

        /// Print the planned batches without running anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Show every step's record for a host
    Status {
        /// Host identifier (defaults to the system hostname)
        #[arg(long)]
        host: Option<String>,
    },
    /// Check the steps file and print the execution order
    Validate,
    /// Return steps to pending so the next run executes them again
    Reset {
        /// Host identifier (defaults to the system hostname)
        #[arg(long)]
        host: Option<String>,

        /// Steps to reset
        #[arg(id = "step_names", required = true, value_name = "STEP")]
        steps: Vec<String>,
    },
}

fn parse_jobs(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["homebox"]).is_err());
    }

    #[test]
    fn test_cli_run_defaults() {
        let cli = Cli::try_parse_from(["homebox", "run"]).unwrap();
        match cli.command {
            Commands::Run {
                host,
                only,
                retry_failed,
                jobs,
                dry_run,
            } => {
                assert!(host.is_none());
                assert!(only.is_empty());
                assert!(!retry_failed);
                assert_eq!(jobs, DEFAULT_JOBS);
                assert!(!dry_run);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_run_with_options() {
        let cli = Cli::try_parse_from([
            "homebox",
            "--steps",
            "/etc/homebox.json",
            "run",
            "--host",
            "vimes",
            "--only",
            "restore-dotfiles",
            "--only",
            "fix-keybinding",
            "--retry-failed",
            "--jobs",
            "2",
        ])
        .unwrap();
        assert_eq!(cli.steps.unwrap().to_str().unwrap(), "/etc/homebox.json");
        match cli.command {
            Commands::Run {
                host,
                only,
                retry_failed,
                jobs,
                ..
            } => {
                assert_eq!(host.as_deref(), Some("vimes"));
                assert_eq!(only, vec!["restore-dotfiles", "fix-keybinding"]);
                assert!(retry_failed);
                assert_eq!(jobs, 2);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_rejects_zero_jobs() {
        assert!(Cli::try_parse_from(["homebox", "run", "--jobs", "0"]).is_err());
    }

    #[test]
    fn test_cli_global_state_dir_after_subcommand() {
        let cli = Cli::try_parse_from(["homebox", "status", "--state-dir", "/tmp/s"]).unwrap();
        assert_eq!(cli.state_dir.unwrap().to_str().unwrap(), "/tmp/s");
        assert!(matches!(cli.command, Commands::Status { host: None }));
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["homebox", "validate"]).unwrap();
        assert!(matches!(cli.command, Commands::Validate));
    }

    #[test]
    fn test_cli_reset_requires_steps() {
        assert!(Cli::try_parse_from(["homebox", "reset", "--host", "vimes"]).is_err());

        let cli = Cli::try_parse_from(["homebox", "reset", "--host", "vimes", "a", "b"]).unwrap();
        match cli.command {
            Commands::Reset { host, steps } => {
                assert_eq!(host.as_deref(), Some("vimes"));
                assert_eq!(steps, vec!["a", "b"]);
            }
            _ => panic!("Expected Reset command"),
        }
    }
}
