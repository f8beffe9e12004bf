//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

/// amd - AMIE mediator
#[derive(Parser)]
#[command(
    name = "amd",
    about = "Mediates AMIE transactions with a local resource-management service",
    version = env!("CARGO_PKG_VERSION"),
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
    /// Run the mediator loop, restarting it after service outages
    Run,

    /// Make one pass over tasks, packets and replies, then exit
    Once,

    /// Inspect the monitoring snapshots
    Snapshots {
        /// Snapshot directory (defaults to the configured snapshot-dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        #[command(subcommand)]
        command: SnapshotsCommand,
    },
}

/// Snapshot inspection subcommands
#[derive(Debug, Subcommand)]
pub enum SnapshotsCommand {
    /// List snapshot keys
    List,

    /// Print one snapshot as JSON
    Show {
        /// Snapshot key, as printed by `list`
        key: String,
    },

    /// Block until the snapshots change
    Watch {
        /// Seconds to wait before giving up
        #[arg(short, long, default_value = "60")]
        timeout: u64,
    },
}

/// Get the log file path
pub fn get_log_path() -> PathBuf {
    debug!("get_log_path: called");
    let path = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("amiemediator")
        .join("logs")
        .join("amiemediator.log");
    debug!(?path, "get_log_path: returning path");
    path
}
