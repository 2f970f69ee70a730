//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// ax - shared ad executor
#[derive(Parser)]
#[command(
    name = "ax",
    about = "Shared ad executor: one elected coordinator serving ad slots for many tabs",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run several simulated tabs against an in-memory ad collaborator
    Simulate {
        /// Number of tabs
        #[arg(short, long, default_value = "2")]
        tabs: usize,

        /// Ad slots per tab
        #[arg(short, long, default_value = "2")]
        slots: usize,

        /// How long to run, in seconds
        #[arg(short, long, default_value = "30")]
        duration_secs: u64,

        /// Close the first tab after this many seconds so its slots get reclaimed
        #[arg(long)]
        close_tab_after: Option<u64>,

        /// Skip the shared host; every tab runs its own coordinator
        #[arg(long)]
        force_compat: bool,

        /// Probability that a render fails (0.0 - 1.0)
        #[arg(short, long, default_value = "0.2")]
        failure_rate: f64,

        /// Output format for the event stream
        #[arg(long, default_value = "text")]
        format: OutputFormat,
    },

    /// Print the effective configuration
    Config,
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("adexec")
        .join("logs")
        .join("adexec.log")
}

/// Output format for the simulator's event stream
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parsing() {
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!("plain".parse::<OutputFormat>().unwrap(), OutputFormat::Text);
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_simulate_args() {
        let cli = Cli::parse_from(["ax", "-l", "debug", "simulate", "--tabs", "3", "--force-compat", "--format", "json"]);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        match cli.command {
            Command::Simulate {
                tabs,
                slots,
                force_compat,
                format,
                close_tab_after,
                ..
            } => {
                assert_eq!(tabs, 3);
                assert_eq!(slots, 2);
                assert!(force_compat);
                assert_eq!(format, OutputFormat::Json);
                assert!(close_tab_after.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_log_path_ends_with_adexec_log() {
        assert!(get_log_path().ends_with("adexec/logs/adexec.log"));
    }
}
