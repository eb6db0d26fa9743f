//! Configuration management for runspace-coordinator.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cli::Args;
use crate::coordinator::CoordinatorConfig;
use crate::engine::EngineVersion;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Execution settings.
    pub execution: ExecutionSection,
    /// Debugger settings.
    pub debugger: DebuggerSection,
    /// Event channel settings.
    pub events: EventsSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Execution configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSection {
    /// Oldest accepted engine version, in `major.minor` form.
    pub minimum_engine_version: String,
    /// Re-probe the session identity after each request.
    pub probe_after_execution: bool,
}

impl Default for ExecutionSection {
    fn default() -> Self {
        Self {
            minimum_engine_version: "5.1".to_string(),
            probe_after_execution: true,
        }
    }
}

/// Debugger configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerSection {
    /// Restart an interrupted read loop once the debugger resumes.
    pub restart_read_loop_after_resume: bool,
}

impl Default for DebuggerSection {
    fn default() -> Self {
        Self {
            restart_read_loop_after_resume: true,
        }
    }
}

/// Event channel configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    /// Events buffered per subscriber before the slowest one lags.
    pub capacity: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        serde_json::from_str(&content).map_err(ConfigError::Json)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        if let Ok(level) = std::env::var("RUNSPACE_COORDINATOR_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }

        if let Ok(version) = std::env::var("RUNSPACE_COORDINATOR_MIN_ENGINE_VERSION") {
            if !version.is_empty() {
                self.execution.minimum_engine_version = version;
            }
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if let Some(ref version) = args.min_engine_version {
            self.execution.minimum_engine_version = version.clone();
        }

        if args.no_probe {
            self.execution.probe_after_execution = false;
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();
        config.apply_args(args);

        Ok(config)
    }

    /// Convert to the runtime settings of a coordinator.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig, ConfigError> {
        let minimum_engine_version: EngineVersion = self
            .execution
            .minimum_engine_version
            .parse()
            .map_err(|_| {
                ConfigError::InvalidVersion(self.execution.minimum_engine_version.clone())
            })?;

        Ok(CoordinatorConfig {
            minimum_engine_version,
            probe_after_execution: self.execution.probe_after_execution,
            restart_read_loop_after_resume: self.debugger.restart_read_loop_after_resume,
            event_capacity: self.events.capacity,
        })
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// JSON parsing error.
    Json(serde_json::Error),
    /// Engine version not in `major.minor` form.
    InvalidVersion(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "failed to read config file: {}", e),
            Self::Json(e) => write!(f, "failed to parse config file: {}", e),
            Self::InvalidVersion(v) => write!(f, "invalid engine version: {}", v),
        }
    }
}

impl std::error::Error for ConfigError {}
