//! Configuration loading for the state indexer.
//!
//! Layered config: defaults -> config file -> explicit file -> env vars.
//! The default config file lives at ~/.config/state-indexer/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::TypesError;

/// Bulk reindex tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexSettings {
    /// Records requested per snapshot page
    #[serde(default = "default_snapshot_page_size")]
    pub snapshot_page_size: usize,

    /// Records handed to `Index` per call during bulk indexing and replay
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per indexer before giving up until the next restart
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Terminal jobs kept for inspection
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_snapshot_page_size() -> usize {
    500
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    5
}

fn default_history_limit() -> usize {
    64
}

impl Default for ReindexSettings {
    fn default() -> Self {
        Self {
            snapshot_page_size: default_snapshot_page_size(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            history_limit: default_history_limit(),
        }
    }
}

impl ReindexSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.snapshot_page_size == 0 {
            return Err("snapshot_page_size must be > 0".to_string());
        }
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max_attempts must be > 0".to_string());
        }
        Ok(())
    }
}

/// Exponential backoff schedule for transient errors and job retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// First delay
    #[serde(default = "default_initial_interval_ms")]
    pub initial_interval_ms: u64,

    /// Upper bound on a single delay
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Growth factor between delays
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Give up on a call site after this long
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

fn default_initial_interval_ms() -> u64 {
    100
}

fn default_max_interval_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_elapsed_secs() -> u64 {
    60
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval_ms: default_initial_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            multiplier: default_multiplier(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl RetrySettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_interval_ms == 0 {
            return Err("initial_interval_ms must be > 0".to_string());
        }
        if self.max_interval_ms < self.initial_interval_ms {
            return Err(format!(
                "max_interval_ms ({}) must be >= initial_interval_ms ({})",
                self.max_interval_ms, self.initial_interval_ms
            ));
        }
        if self.multiplier < 1.0 {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        Ok(())
    }
}

/// Change dispatcher tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Events buffered per indexer while it is being reindexed
    #[serde(default = "default_replay_queue_capacity")]
    pub replay_queue_capacity: usize,
}

fn default_replay_queue_capacity() -> usize {
    10_000
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            replay_queue_capacity: default_replay_queue_capacity(),
        }
    }
}

impl DispatcherSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.replay_queue_capacity == 0 {
            return Err("replay_queue_capacity must be > 0".to_string());
        }
        Ok(())
    }
}

/// Main settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to the RocksDB directory holding version checkpoints
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Bulk reindex tuning
    #[serde(default)]
    pub reindex: ReindexSettings,

    /// Backoff schedule
    #[serde(default)]
    pub retry: RetrySettings,

    /// Change dispatcher tuning
    #[serde(default)]
    pub dispatcher: DispatcherSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "state-indexer")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_level: default_log_level(),
            reindex: ReindexSettings::default(),
            retry: RetrySettings::default(),
            dispatcher: DispatcherSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/state-indexer/config.toml)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (STATE_INDEXER_*, `__` between nested keys)
    pub fn load(config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "state-indexer")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // STATE_INDEXER_REINDEX__BATCH_SIZE, STATE_INDEXER_DISPATCHER__REPLAY_QUEUE_CAPACITY, ...
        builder = builder.add_source(
            Environment::with_prefix("STATE_INDEXER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: Settings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), TypesError> {
        self.reindex
            .validate()
            .and_then(|_| self.retry.validate())
            .and_then(|_| self.dispatcher.validate())
            .map_err(TypesError::Config)
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        PathBuf::from(&self.db_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.reindex.batch_size, 100);
        assert_eq!(settings.reindex.snapshot_page_size, 500);
        assert_eq!(settings.dispatcher.replay_queue_capacity, 10_000);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_with_defaults() {
        let settings = Settings::load(None).unwrap();
        assert!(settings.reindex.max_attempts > 0);
    }

    #[test]
    fn test_load_from_explicit_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "log_level = \"debug\"\n[reindex]\nbatch_size = 7\n[dispatcher]\nreplay_queue_capacity = 3"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.reindex.batch_size, 7);
        assert_eq!(settings.reindex.snapshot_page_size, 500);
        assert_eq!(settings.dispatcher.replay_queue_capacity, 3);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[reindex]\nbatch_size = 0").unwrap();

        let result = Settings::load(Some(file.path().to_str().unwrap()));
        assert!(matches!(result, Err(TypesError::Config(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Settings::load(Some("/definitely/not/here.toml")).is_err());
    }

    #[test]
    fn test_retry_validation() {
        let retry = RetrySettings {
            initial_interval_ms: 500,
            max_interval_ms: 100,
            ..Default::default()
        };
        assert!(retry.validate().is_err());

        let retry = RetrySettings {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(retry.validate().is_err());
    }

    #[test]
    fn test_expanded_db_path_passthrough() {
        let settings = Settings {
            db_path: "/var/lib/state-indexer".to_string(),
            ..Default::default()
        };
        assert_eq!(
            settings.expanded_db_path(),
            PathBuf::from("/var/lib/state-indexer")
        );
    }
}
