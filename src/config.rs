//! Worker pool configuration.
//!
//! Configuration can be built in code, read from `COMPUTE_*` environment
//! variables, or loaded from a YAML file. Every source is validated before
//! a pool accepts it.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound applied to the default `max_workers`.
const DEFAULT_MAX_WORKERS_CAP: usize = 16;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Workers created at startup and kept alive at all times.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,
    /// Upper bound for scaling.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Run the auto-scaling control loop.
    #[serde(default = "default_auto_scale")]
    pub auto_scale: bool,
    /// Interval of the dispatch loop in milliseconds.
    #[serde(default = "default_dispatch_tick_ms")]
    pub dispatch_tick_ms: u64,
    /// Interval of the auto-scaling loop in milliseconds.
    #[serde(default = "default_scale_tick_ms")]
    pub scale_tick_ms: u64,
    /// Scale up once queued jobs exceed this multiple of the worker count.
    #[serde(default = "default_scale_up_queue_factor")]
    pub scale_up_queue_factor: usize,
}

fn default_min_workers() -> usize {
    2
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(DEFAULT_MAX_WORKERS_CAP)
        .max(default_min_workers())
}

fn default_auto_scale() -> bool {
    true
}

fn default_dispatch_tick_ms() -> u64 {
    10
}

fn default_scale_tick_ms() -> u64 {
    5000
}

fn default_scale_up_queue_factor() -> usize {
    2
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            auto_scale: default_auto_scale(),
            dispatch_tick_ms: default_dispatch_tick_ms(),
            scale_tick_ms: default_scale_tick_ms(),
            scale_up_queue_factor: default_scale_up_queue_factor(),
        }
    }
}

impl PoolConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a fixed-size configuration with auto-scaling disabled.
    pub fn fixed(workers: usize) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            auto_scale: false,
            ..Self::default()
        }
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `COMPUTE_MIN_WORKERS`: Minimum workers (default: 2)
    /// - `COMPUTE_MAX_WORKERS`: Maximum workers (default: available parallelism, capped at 16)
    /// - `COMPUTE_AUTO_SCALE`: Enable auto-scaling (default: true)
    /// - `COMPUTE_DISPATCH_TICK_MS`: Dispatch interval (default: 10)
    /// - `COMPUTE_SCALE_TICK_MS`: Auto-scaling interval (default: 5000)
    /// - `COMPUTE_SCALE_UP_FACTOR`: Queue/worker ratio that triggers growth (default: 2)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file, then applies environment overrides.
    ///
    /// Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, or the
    /// result is invalid.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PoolConfig = serde_yaml::from_str(&content)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(val) = std::env::var("COMPUTE_MIN_WORKERS") {
            self.min_workers = parse_env_value(&val, "COMPUTE_MIN_WORKERS")?;
        }

        if let Ok(val) = std::env::var("COMPUTE_MAX_WORKERS") {
            self.max_workers = parse_env_value(&val, "COMPUTE_MAX_WORKERS")?;
        }

        if let Ok(val) = std::env::var("COMPUTE_AUTO_SCALE") {
            self.auto_scale = parse_env_bool(&val, "COMPUTE_AUTO_SCALE")?;
        }

        if let Ok(val) = std::env::var("COMPUTE_DISPATCH_TICK_MS") {
            self.dispatch_tick_ms = parse_env_value(&val, "COMPUTE_DISPATCH_TICK_MS")?;
        }

        if let Ok(val) = std::env::var("COMPUTE_SCALE_TICK_MS") {
            self.scale_tick_ms = parse_env_value(&val, "COMPUTE_SCALE_TICK_MS")?;
        }

        if let Ok(val) = std::env::var("COMPUTE_SCALE_UP_FACTOR") {
            self.scale_up_queue_factor = parse_env_value(&val, "COMPUTE_SCALE_UP_FACTOR")?;
        }

        Ok(())
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "min_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(format!(
                "min_workers ({}) cannot exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }

        if self.dispatch_tick_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "dispatch_tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.scale_tick_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "scale_tick_ms must be greater than 0".to_string(),
            ));
        }

        if self.scale_up_queue_factor == 0 {
            return Err(ConfigError::ValidationFailed(
                "scale_up_queue_factor must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Clamps a requested worker count into `[min_workers, max_workers]`.
    pub fn clamp_workers(&self, target: usize) -> usize {
        target.clamp(self.min_workers, self.max_workers)
    }

    /// Dispatch loop interval.
    pub fn dispatch_tick(&self) -> Duration {
        Duration::from_millis(self.dispatch_tick_ms)
    }

    /// Auto-scaling loop interval.
    pub fn scale_tick(&self) -> Duration {
        Duration::from_millis(self.scale_tick_ms)
    }

    /// Builder method to set the minimum worker count.
    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    /// Builder method to set the maximum worker count.
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    /// Builder method to enable or disable auto-scaling.
    pub fn with_auto_scale(mut self, enabled: bool) -> Self {
        self.auto_scale = enabled;
        self
    }

    /// Builder method to set the dispatch interval.
    pub fn with_dispatch_tick(mut self, tick: Duration) -> Self {
        self.dispatch_tick_ms = tick.as_millis() as u64;
        self
    }

    /// Builder method to set the auto-scaling interval.
    pub fn with_scale_tick(mut self, tick: Duration) -> Self {
        self.scale_tick_ms = tick.as_millis() as u64;
        self
    }

    /// Builder method to set the scale-up queue factor.
    pub fn with_scale_up_queue_factor(mut self, factor: usize) -> Self {
        self.scale_up_queue_factor = factor;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
