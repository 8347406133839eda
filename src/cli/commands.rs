//! CLI command definitions for gradewatch.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, warn};

use crate::grader::ipc;
use crate::metrics;
use crate::supervisor::{Supervisor, SupervisorError};

/// Pull-based grading worker pool.
#[derive(Parser)]
#[command(name = "gradewatch")]
#[command(about = "Poll submission queues, grade student code in a jail, post verdicts")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// YAML or JSON file to use for all configuration.
    #[arg(short = 'f', long = "config-file", env = "GRADEWATCH_CONFIG")]
    pub config_file: Option<PathBuf>,

    /// Quit if the configuration names no clients.
    #[arg(short = 'e', long)]
    pub quit_if_empty: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Subcommands; the default (none) runs the watcher.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Grade a single submission streamed on stdin. Spawned internally by
    /// the per-item isolation path; not for interactive use.
    #[command(name = "grade-one", hide = true)]
    GradeOne,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed command and returns the process exit code:
/// 0 for a normal shutdown, 9 for a join failure during shutdown, 2 for a
/// configuration error, 1 for anything else fatal.
pub async fn run_with_cli(cli: Cli) -> i32 {
    match cli.command {
        Some(Commands::GradeOne) => ipc::serve_grade_one().await,
        None => run_watcher(cli).await,
    }
}

async fn run_watcher(cli: Cli) -> i32 {
    let Some(config_file) = cli.config_file else {
        error!("A configuration file is required (-f/--config-file)");
        return 2;
    };

    if let Err(err) = metrics::init_metrics() {
        warn!(error = %err, "Metrics registration failed, continuing without");
    }

    let mut supervisor = Supervisor::new(&config_file);
    if let Err(err) = supervisor.configure_from_file() {
        error!(error = %err, config = %config_file.display(), "Configuration failed");
        return 2;
    }

    supervisor.start();
    match supervisor.wait(cli.quit_if_empty).await {
        Ok(()) => 0,
        Err(SupervisorError::JoinFailure(reason)) => {
            error!(reason = %reason, "Join failure during shutdown");
            9
        }
        Err(err) => {
            error!(error = %err, "Supervisor exited");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_config_file_flag() {
        let cli = Cli::try_parse_from(["gradewatch", "-f", "/etc/gradewatch.yml", "-e"]).unwrap();
        assert_eq!(cli.config_file, Some(PathBuf::from("/etc/gradewatch.yml")));
        assert!(cli.quit_if_empty);
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_grade_one_subcommand() {
        let cli = Cli::try_parse_from(["gradewatch", "grade-one"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::GradeOne)));
    }

    #[tokio::test]
    async fn test_missing_config_is_exit_code_2() {
        let cli = Cli::try_parse_from(["gradewatch"]).unwrap();
        assert_eq!(run_with_cli(cli).await, 2);
    }
}
