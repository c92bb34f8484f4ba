//! Configuration for the engine, hosts and session runners
//!
//! Everything deserializes from TOML with struct-level defaults, so a
//! minimal file only names what differs from the documented values.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;
use crate::runner::RunnerMode;

pub const DEFAULT_DB_FILE: &str = "tracemon.db";
pub const DEFAULT_INTERVAL_S: f64 = 1.0;
pub const DEFAULT_FAULT_TOLERANCE: usize = 10;
pub const DEFAULT_COMMAND_DELAY_MS: u64 = 50;
pub const DEFAULT_STOP_TIMEOUT_S: u64 = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 250;
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Where and how the persistence engine keeps its database
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory the database file lives in; must already exist
    pub location: String,
    pub file_name: String,
    /// Keep rows from previous runs instead of starting empty
    pub cumulative: bool,
    /// Writer idle poll while waiting for work
    pub poll_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            location: ".".to_string(),
            file_name: DEFAULT_DB_FILE.to_string(),
            cumulative: false,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl StoreConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// One monitored host and its credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Unique name the host is addressed by throughout a run
    pub alias: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub certificate: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            alias: String::new(),
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            username: String::new(),
            password: None,
            certificate: None,
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alias.is_empty() {
            return Err(ConfigError::MissingAlias);
        }
        if self.host.is_empty() {
            return Err(ConfigError::MissingHost(self.alias.clone()));
        }
        Ok(())
    }
}

/// Pacing and fault handling for one session runner
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub name: String,
    /// Seconds between command-stage ticks
    pub interval_s: f64,
    /// Consecutive failures tolerated before the runner stops itself
    pub fault_tolerance: usize,
    pub mode: RunnerMode,
    /// Pause between commands within one tick
    pub command_delay_ms: u64,
    /// How long `stop` waits for the worker thread
    pub stop_timeout_s: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            interval_s: DEFAULT_INTERVAL_S,
            fault_tolerance: DEFAULT_FAULT_TOLERANCE,
            mode: RunnerMode::Persistent,
            command_delay_ms: DEFAULT_COMMAND_DELAY_MS,
            stop_timeout_s: DEFAULT_STOP_TIMEOUT_S,
        }
    }
}

impl RunnerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, seconds: f64) -> Self {
        self.interval_s = seconds;
        self
    }

    pub fn with_fault_tolerance(mut self, tolerance: usize) -> Self {
        self.fault_tolerance = tolerance;
        self
    }

    pub fn with_mode(mut self, mode: RunnerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_s).unwrap_or(Duration::from_secs(1))
    }

    pub fn command_delay(&self) -> Duration {
        Duration::from_millis(self.command_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_s <= 0.0 {
            return Err(ConfigError::ZeroInterval(self.name.clone()));
        }
        if self.fault_tolerance == 0 {
            return Err(ConfigError::ZeroFaultTolerance(self.name.clone()));
        }
        Ok(())
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub store: StoreConfig,
    pub log: LogConfig,
    pub hosts: Vec<HostConfig>,
}

impl MonitorConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|err| ConfigError::Parse {
            path: "<inline>".to_string(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for host in &self.hosts {
            host.validate()?;
            if !seen.insert(host.alias.as_str()) {
                return Err(ConfigError::DuplicateAlias(host.alias.clone()));
            }
        }
        Ok(())
    }
}
