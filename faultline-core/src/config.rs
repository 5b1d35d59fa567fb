//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/faultline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/faultline/` (~/.config/faultline/)
//! - Data: `$XDG_DATA_HOME/faultline/` (~/.local/share/faultline/)
//! - State/Logs: `$XDG_STATE_HOME/faultline/` (~/.local/state/faultline/)
//!
//! The `[telemetry]` table is passed to [`resolve`](crate::resolver::resolve)
//! as-is, so it uses the same keys as any other configuration input.

use crate::error::{Error, Result};
use crate::queue::{QueueOptions, DEFAULT_RETRY_DELAYS_MS};
use crate::resolver::{resolve, ConfigInput, ResolvedConfig, Settings};
use crate::transport::DEFAULT_TIMEOUT_SECS;
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Raw telemetry settings, validated by the resolver
    #[serde(default)]
    pub telemetry: Option<toml::Table>,

    /// Scrub patterns compiled from strings
    #[serde(default)]
    pub scrubbing: ScrubbingConfig,

    /// HTTP delivery tuning
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Scrub patterns written as regular expressions
///
/// When set, these replace the built-in patterns. Compilation happens here,
/// never in the resolver.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ScrubbingConfig {
    pub patterns: Option<Vec<String>>,
}

impl ScrubbingConfig {
    /// Compile the configured patterns
    pub fn compile(&self) -> Result<Option<Vec<Regex>>> {
        let Some(patterns) = &self.patterns else {
            return Ok(None);
        };

        patterns
            .iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| Error::Config(format!("invalid scrubbing pattern {:?}: {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }
}

/// HTTP delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Backoff between consecutive failed sends
    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            retry_delays_ms: default_retry_delays_ms(),
        }
    }
}

impl DeliveryConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "delivery.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_retry_delays_ms() -> Vec<u64> {
    DEFAULT_RETRY_DELAYS_MS.to_vec()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.delivery.validate()?;
        Ok(config)
    }

    /// Build resolver input from `[telemetry]` and `[scrubbing]`
    pub fn telemetry_input(&self) -> Result<ConfigInput> {
        let mut input = match &self.telemetry {
            Some(table) => ConfigInput::from_toml(table.clone())?,
            None => ConfigInput::new(),
        };

        if let Some(patterns) = self.scrubbing.compile()? {
            input = input.with_scrub_patterns(patterns);
        }

        Ok(input)
    }

    /// Validate and normalize the telemetry settings
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        Ok(resolve(&self.telemetry_input()?)?)
    }

    /// Queue sizing from resolved settings plus `[delivery]` backoff
    pub fn queue_options(&self, settings: &Settings) -> QueueOptions {
        QueueOptions {
            retry_delays: self.delivery.retry_delays(),
            ..QueueOptions::from_settings(settings)
        }
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/faultline/config.toml` (~/.config/faultline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("faultline").join("config.toml")
    }

    /// Returns the data directory path (for the queue database)
    ///
    /// `$XDG_DATA_HOME/faultline/` (~/.local/share/faultline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("faultline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/faultline/` (~/.local/state/faultline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("faultline")
    }

    /// Returns the persistent queue file path
    ///
    /// `$XDG_DATA_HOME/faultline/queue.db` (~/.local/share/faultline/queue.db)
    pub fn queue_db_path() -> PathBuf {
        Self::data_dir().join("queue.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/faultline/faultline.log` (~/.local/state/faultline/faultline.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("faultline.log")
    }
}
