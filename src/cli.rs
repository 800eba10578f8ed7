//! Command line interface built on clap.
//!
//! [`Cli`] carries the [`Command`] subcommands (check, run, tasks) and the
//! global flags (--config, --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// statewright: run task pipelines on workflow state transitions.
#[derive(Debug, Parser)]
#[command(name = "statewright", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file to use instead of ./statewright.toml.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Number of task units the local job system runs at once.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Log at debug level.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Validates a workflow document and prints a summary.
    Check {
        /// Path to the workflow TOML document.
        file: PathBuf,
    },

    /// Walks a subject through one or more transitions of a workflow.
    Run {
        /// Path to the workflow TOML document.
        file: PathBuf,

        /// Subject reference as TYPE:ID.
        #[arg(long, value_parser = parse_subject)]
        subject: statewright::SubjectRef,

        /// Target state codes, applied in order.
        #[arg(long = "to", required = true, num_args = 1..)]
        to: Vec<String>,
    },

    /// Lists the installed tasks.
    Tasks,
}

fn parse_subject(raw: &str) -> Result<statewright::SubjectRef, String> {
    statewright::SubjectRef::parse(raw).ok_or_else(|| format!("expected TYPE:ID, got `{raw}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_check_subcommand() {
        let cli = Cli::parse_from(["statewright", "check", "tickets.toml"]);
        match cli.command {
            Command::Check { file } => assert_eq!(file, PathBuf::from("tickets.toml")),
            _ => panic!("expected Check command"),
        }
    }

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from([
            "statewright",
            "run",
            "tickets.toml",
            "--subject",
            "ticket:42",
            "--to",
            "review",
            "closed",
        ]);
        match cli.command {
            Command::Run { file, subject, to } => {
                assert_eq!(file, PathBuf::from("tickets.toml"));
                assert_eq!(subject.subject_type, "ticket");
                assert_eq!(subject.subject_id, "42");
                assert_eq!(to, vec!["review", "closed"]);
            }
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_rejects_malformed_subject() {
        let err = Cli::try_parse_from([
            "statewright",
            "run",
            "tickets.toml",
            "--subject",
            "ticket",
            "--to",
            "closed",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("TYPE:ID"));
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "statewright",
            "--config",
            "custom.toml",
            "--workers",
            "8",
            "--verbose",
            "tasks",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.workers, Some(8));
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Tasks));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
