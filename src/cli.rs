//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// reqpacer - Rate-limited task scheduler
#[derive(Parser)]
#[command(
    name = "rp",
    about = "Rate-limited task scheduler: release at most N calls per period",
    version = env!("CARGO_PKG_VERSION"),
    after_help = "Logs are written to: ~/.local/share/reqpacer/logs/reqpacer.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short, long, global = true, help = "Log level (overrides config file)")]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Query a simulated service from worker threads through the scheduler
    Demo {
        /// Total queries to submit
        #[arg(short, long)]
        requests: Option<usize>,

        /// Worker threads submitting concurrently
        #[arg(short, long)]
        workers: Option<usize>,

        /// Max queries released per tick
        #[arg(short, long)]
        max_task: Option<usize>,

        /// Delay between ticks in milliseconds
        #[arg(short, long)]
        period_ms: Option<u64>,

        /// Time one query takes in milliseconds
        #[arg(short, long)]
        query_ms: Option<u64>,
    },

    /// Print the effective configuration
    ShowConfig {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: OutputFormat,
    },
}

/// Output format for show-config
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Yaml,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: yaml or json", s)),
        }
    }
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reqpacer")
        .join("logs")
        .join("reqpacer.log")
}
