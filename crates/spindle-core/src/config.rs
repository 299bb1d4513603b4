//! Engine configuration, usually loaded from `spindle.toml`.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on simultaneously running work functions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Age after which a task is expired and evicted.
    #[serde(default = "default_task_ttl_ms")]
    pub task_ttl_ms: u64,

    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    /// Sleep after a failed sweep.
    #[serde(default = "default_reaper_retry_ms")]
    pub reaper_retry_ms: u64,

    /// `max_retries` used when a submission does not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default)]
    pub callbacks: CallbackSettings,
}

/// Where the built-in failure callbacks write.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CallbackSettings {
    #[serde(default = "default_failure_dir")]
    pub failure_dir: PathBuf,

    /// Per-task scratch directories live at `<scratch_dir>/task_<id>`.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    #[serde(default = "default_stats_file")]
    pub stats_file: PathBuf,

    /// Destination for `send_notification`.
    #[serde(default = "default_notification_destination")]
    pub notification_destination: String,
}

fn default_max_concurrent() -> usize {
    5
}

// 24h
fn default_task_ttl_ms() -> u64 {
    86_400_000
}

// 1h
fn default_reaper_interval_ms() -> u64 {
    3_600_000
}

// 5min
fn default_reaper_retry_ms() -> u64 {
    300_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_failure_dir() -> PathBuf {
    PathBuf::from("logs/failures")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("logs/failure_stats.json")
}

fn default_notification_destination() -> String {
    "ops".to_string()
}

/// Largest accepted `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            task_ttl_ms: default_task_ttl_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
            reaper_retry_ms: default_reaper_retry_ms(),
            default_max_retries: default_max_retries(),
            callbacks: CallbackSettings::default(),
        }
    }
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            failure_dir: default_failure_dir(),
            scratch_dir: default_scratch_dir(),
            stats_file: default_stats_file(),
            notification_destination: default_notification_destination(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.task_ttl_ms == 0 {
            return Err(ConfigError::Invalid(
                "task_ttl_ms must be positive".to_string(),
            ));
        }
        if self.reaper_interval_ms == 0 || self.reaper_retry_ms == 0 {
            return Err(ConfigError::Invalid(
                "reaper intervals must be positive".to_string(),
            ));
        }
        if self.default_max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "default_max_retries must be at most {MAX_RETRIES_LIMIT}"
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.task_ttl_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    pub fn reaper_retry(&self) -> Duration {
        Duration::from_millis(self.reaper_retry_ms)
    }
}
