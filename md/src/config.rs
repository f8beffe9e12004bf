//! Mediator configuration types and loading

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;
use crate::timing::WaitParms;

/// Main mediator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote (AMIE) service settings
    pub amie: AmieConfig,

    /// Local service settings
    pub local: LocalConfig,

    /// Directory for monitoring snapshots
    #[serde(rename = "snapshot-dir")]
    pub snapshot_dir: PathBuf,

    #[serde(rename = "log-level")]
    pub log_level: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            amie: AmieConfig::default(),
            local: LocalConfig::default(),
            snapshot_dir: PathBuf::from("/tmp/amiemediator"),
            log_level: None,
        }
    }
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.amie.site_name.trim().is_empty() {
            return Err(eyre::eyre!("amie.site-name must be set"));
        }
        if std::env::var(&self.amie.api_key_env).is_err() {
            return Err(eyre::eyre!(
                "AMIE API key not found. Set the {} environment variable.",
                self.amie.api_key_env
            ));
        }
        Ok(())
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local config: .amiemediator.yml
        let local_config = PathBuf::from(".amiemediator.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User config: ~/.config/amiemediator/amiemediator.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("amiemediator").join("amiemediator.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Log level from the config file, read before logging is set up
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Remote poll delays: (reply, busy, idle)
    pub fn amie_wait_parms(&self) -> WaitParms {
        WaitParms::new(
            Duration::from_secs(self.amie.reply_delay),
            Duration::from_secs(self.amie.busy_loop_delay),
            Duration::from_secs(self.amie.idle_loop_delay),
        )
    }

    /// Local poll delays: (busy task, queued task, absent task)
    pub fn local_wait_parms(&self) -> WaitParms {
        WaitParms::new(
            Duration::from_secs(self.local.busy_task_loop_delay),
            Duration::from_secs(self.local.queued_task_loop_delay),
            Duration::from_secs(self.local.absent_task_loop_delay),
        )
    }
}

/// Remote (AMIE) service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmieConfig {
    /// Our site name; packets for other sites are ignored
    #[serde(rename = "site-name")]
    pub site_name: String,

    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Environment variable containing the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    #[serde(rename = "min-retry-delay")]
    pub min_retry_delay: u64,

    #[serde(rename = "max-retry-delay")]
    pub max_retry_delay: u64,

    #[serde(rename = "retry-time-max")]
    pub retry_time_max: u64,

    #[serde(rename = "idle-loop-delay")]
    pub idle_loop_delay: u64,

    #[serde(rename = "busy-loop-delay")]
    pub busy_loop_delay: u64,

    #[serde(rename = "reply-delay")]
    pub reply_delay: u64,
}

impl Default for AmieConfig {
    fn default() -> Self {
        Self {
            site_name: String::new(),
            base_url: "https://amieclient.xsede.org/v0.10".to_string(),
            api_key_env: "AMIE_API_KEY".to_string(),
            timeout_ms: 60_000,
            min_retry_delay: 60,
            max_retry_delay: 3600,
            retry_time_max: 14400,
            idle_loop_delay: 3600,
            busy_loop_delay: 60,
            reply_delay: 10,
        }
    }
}

impl AmieConfig {
    pub fn get_api_key(&self) -> Result<String> {
        std::env::var(&self.api_key_env).context(format!("Environment variable {} not set", self.api_key_env))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            min_retry_delay: Duration::from_secs(self.min_retry_delay),
            max_retry_delay: Duration::from_secs(self.max_retry_delay),
            retry_time_max: Duration::from_secs(self.retry_time_max),
        }
    }
}

/// Local service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    #[serde(rename = "base-url")]
    pub base_url: String,

    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    #[serde(rename = "min-retry-delay")]
    pub min_retry_delay: u64,

    #[serde(rename = "max-retry-delay")]
    pub max_retry_delay: u64,

    #[serde(rename = "retry-time-max")]
    pub retry_time_max: u64,

    #[serde(rename = "absent-task-loop-delay")]
    pub absent_task_loop_delay: u64,

    #[serde(rename = "queued-task-loop-delay")]
    pub queued_task_loop_delay: u64,

    #[serde(rename = "busy-task-loop-delay")]
    pub busy_task_loop_delay: u64,

    /// Site task names keyed by operation, where they differ
    #[serde(rename = "task-names")]
    pub task_names: HashMap<String, String>,

    /// Operations this site does not support
    pub unsupported: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/amie".to_string(),
            timeout_ms: 60_000,
            min_retry_delay: 60,
            max_retry_delay: 3600,
            retry_time_max: 14400,
            absent_task_loop_delay: 21600,
            queued_task_loop_delay: 600,
            busy_task_loop_delay: 60,
            task_names: HashMap::new(),
            unsupported: Vec::new(),
        }
    }
}

impl LocalConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            min_retry_delay: Duration::from_secs(self.min_retry_delay),
            max_retry_delay: Duration::from_secs(self.max_retry_delay),
            retry_time_max: Duration::from_secs(self.retry_time_max),
        }
    }
}
