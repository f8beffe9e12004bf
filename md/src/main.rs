//! amd - AMIE mediator
//!
//! CLI entry point for running the mediator and inspecting its snapshots.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tracing::{debug, info};

use amiemediator::cli::{Cli, Command, SnapshotsCommand, get_log_path};
use amiemediator::config::Config;
use amiemediator::mediator::Mediator;
use amiemediator::snapshot::{DirSnapshots, SnapshotStore};

fn parse_level(level: &str) -> Option<tracing::Level> {
    match level.to_uppercase().as_str() {
        "TRACE" => Some(tracing::Level::TRACE),
        "DEBUG" => Some(tracing::Level::DEBUG),
        "INFO" => Some(tracing::Level::INFO),
        "WARN" | "WARNING" => Some(tracing::Level::WARN),
        "ERROR" => Some(tracing::Level::ERROR),
        _ => None,
    }
}

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // CLI --log-level > config file > INFO
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => parse_level(s).unwrap_or_else(|| {
            eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
            tracing::Level::INFO
        }),
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    info!(site_name = %config.amie.site_name, "amd loaded config");

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::Run => cmd_run(&config).await,
        Command::Once => cmd_once(&config).await,
        Command::Snapshots { dir, command } => {
            let dir = dir.unwrap_or_else(|| config.snapshot_dir.clone());
            match command {
                SnapshotsCommand::List => cmd_snapshots_list(dir),
                SnapshotsCommand::Show { key } => cmd_snapshots_show(dir, &key),
                SnapshotsCommand::Watch { timeout } => cmd_snapshots_watch(dir, timeout).await,
            }
        }
    }
}

fn build_mediator(config: &Config) -> Result<Mediator> {
    config.validate()?;
    Mediator::from_config(config).context("Failed to start mediator")
}

async fn cmd_run(config: &Config) -> Result<()> {
    debug!("cmd_run: called");
    let mut mediator = build_mediator(config)?;
    println!("{} mediating for {}", "amd".cyan().bold(), config.amie.site_name);
    mediator
        .run_loop_persistently()
        .await
        .context("Mediator loop stopped")
}

async fn cmd_once(config: &Config) -> Result<()> {
    debug!("cmd_once: called");
    let mut mediator = build_mediator(config)?;
    mediator.run_once().await.context("Mediator pass failed")?;
    println!(
        "{} {} transaction(s) in flight",
        "✓".green(),
        mediator.transactions().len()
    );
    Ok(())
}

fn cmd_snapshots_list(dir: PathBuf) -> Result<()> {
    debug!(dir = %dir.display(), "cmd_snapshots_list: called");
    let store = DirSnapshots::reader(dir);
    let keys = store.list().context("Failed to list snapshots")?;
    if keys.is_empty() {
        println!("No snapshots in {}", store.dir().display());
        return Ok(());
    }
    for key in keys {
        println!("{}", key);
    }
    Ok(())
}

fn cmd_snapshots_show(dir: PathBuf, key: &str) -> Result<()> {
    debug!(dir = %dir.display(), %key, "cmd_snapshots_show: called");
    let store = DirSnapshots::reader(dir);
    match store.read(key).context("Failed to read snapshot")? {
        Some(record) => {
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        None => Err(eyre::eyre!("No snapshot named '{}'", key)),
    }
}

async fn cmd_snapshots_watch(dir: PathBuf, timeout: u64) -> Result<()> {
    debug!(dir = %dir.display(), timeout, "cmd_snapshots_watch: called");
    let store = DirSnapshots::reader(dir);
    let since = store.version();
    match store.wait_for_change(since, Duration::from_secs(timeout)).await {
        Some(version) => println!("{} snapshots changed (version {})", "✓".green(), version),
        None => println!("{} no change within {}s", "…".yellow(), timeout),
    }
    Ok(())
}
