//! Configuration management for Turnstile.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// Prefix of environment overrides, e.g. `TURNSTILE__LOG__LEVEL=debug`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Policy source configuration
    #[serde(default)]
    pub policy: PolicySourceConfig,

    /// Admission controller configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Queue and worker configuration
    #[serde(default)]
    pub queues: QueueConfig,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Where the default policy comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    /// Path to the JSON policy file
    #[serde(default = "default_policy_path")]
    pub path: PathBuf,

    /// Policy file poll interval in seconds, 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("policy.json")
}

fn default_reload_interval() -> u64 {
    30
}

/// Admission controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Deadline for each store round trip in milliseconds
    #[serde(default = "default_store_timeout")]
    pub store_timeout_ms: u64,

    /// Largest accepted batch submission
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Expired store entry purge interval in seconds, 0 disables purging
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            store_timeout_ms: default_store_timeout(),
            max_batch_size: default_max_batch_size(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_store_timeout() -> u64 {
    2000
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    60
}

/// Queue and worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub job_capacity: usize,

    #[serde(default = "default_queue_capacity")]
    pub decision_capacity: usize,

    /// Number of decision writer tasks
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            job_capacity: default_queue_capacity(),
            decision_capacity: default_queue_capacity(),
            writer_workers: default_writer_workers(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_writer_workers() -> usize {
    2
}

impl AdmissionConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Purge interval, `None` when purging is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl PolicySourceConfig {
    /// Poll interval, `None` when reloading is disabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file layered under
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: TurnstileConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig =
            serde_yaml::from_str(yaml).map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.admission.store_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "admission.store_timeout_ms must be > 0".into(),
            ));
        }
        if self.admission.max_batch_size == 0 {
            return Err(TurnstileError::Config(
                "admission.max_batch_size must be > 0".into(),
            ));
        }
        if self.queues.job_capacity == 0 || self.queues.decision_capacity == 0 {
            return Err(TurnstileError::Config("queue capacities must be > 0".into()));
        }
        Ok(())
    }
}
