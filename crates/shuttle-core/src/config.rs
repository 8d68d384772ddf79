//! Runtime configuration.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration. Sources are merged in order: optional TOML file, then
//! environment variables prefixed with `SHUTTLE__`
//! (`SHUTTLE__RETRY__BASE_DELAY_MS=500`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{Priority, QueueError};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShuttleConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
    #[serde(default)]
    pub gc: GcConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Submission defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_priority")]
    pub default_priority: u8,
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
}

/// Backoff: `base_delay_ms * multiplier^(attempts-1)`, capped at `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Added to the priority of a retried job (saturates at 10).
    #[serde(default = "default_priority_boost")]
    pub priority_boost: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// `claim_next` block timeout; also bounds how late a worker sees shutdown.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Handler deadline for job types registered without one.
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,
    /// Tries for a terminal status write before giving up on it.
    #[serde(default = "default_status_write_attempts")]
    pub status_write_attempts: u32,
    /// Pause after a store error before the worker polls again.
    #[serde(default = "default_store_backoff_ms")]
    pub store_backoff_ms: u64,
}

/// Reconciliation of jobs stuck in `processing`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reaper_interval_ms")]
    pub interval_ms: u64,
    /// Slack on top of the job type's deadline before a claim counts as stuck.
    #[serde(default = "default_stuck_grace_ms")]
    pub stuck_grace_ms: u64,
}

/// TTL expiry of terminal status records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gc_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `"trace"`, `"debug"`, `"info"`, `"warn"` or `"error"`. `RUST_LOG` wins.
    #[serde(default = "default_level")]
    pub level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_format")]
    pub format: String,
}

impl ShuttleConfig {
    /// Load from an optional TOML file plus `SHUTTLE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, QueueError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("SHUTTLE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| QueueError::Config(format!("failed to build config: {e}")))?;

        Self::finish(config)
    }

    /// Parse a TOML document (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self, QueueError> {
        let config = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .map_err(|e| QueueError::Config(format!("failed to parse config: {e}")))?;

        Self::finish(config)
    }

    fn finish(config: config::Config) -> Result<Self, QueueError> {
        let parsed: Self = config
            .try_deserialize()
            .map_err(|e| QueueError::Config(format!("failed to deserialize config: {e}")))?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        Priority::new(self.queue.default_priority)?;
        if self.queue.default_max_attempts == 0 {
            return Err(QueueError::InvalidMaxAttempts);
        }
        if !(self.retry.multiplier >= 1.0 && self.retry.multiplier.is_finite()) {
            return Err(QueueError::Config(format!(
                "retry.multiplier must be a finite number >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(QueueError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        if self.worker.poll_timeout_ms == 0 || self.worker.default_deadline_ms == 0 {
            return Err(QueueError::Config(
                "worker.poll_timeout_ms and worker.default_deadline_ms must be positive".into(),
            ));
        }
        if self.worker.status_write_attempts == 0 {
            return Err(QueueError::Config(
                "worker.status_write_attempts must be at least 1".into(),
            ));
        }
        if self.reaper.enabled && self.reaper.interval_ms == 0 {
            return Err(QueueError::Config("reaper.interval_ms must be positive".into()));
        }
        if self.gc.enabled && self.gc.interval_ms == 0 {
            return Err(QueueError::Config("gc.interval_ms must be positive".into()));
        }
        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(QueueError::Config(format!(
                "logging.format must be \"pretty\" or \"json\", got {other:?}"
            ))),
        }
    }
}

impl QueueConfig {
    /// Validated default priority; falls back to 5 when out of range.
    pub fn priority(&self) -> Priority {
        Priority::new(self.default_priority).unwrap_or_default()
    }
}

impl WorkerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn store_backoff(&self) -> Duration {
        Duration::from_millis(self.store_backoff_ms)
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stuck_grace(&self) -> Duration {
        Duration::from_millis(self.stuck_grace_ms)
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_priority: default_priority(),
            default_max_attempts: default_max_attempts(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            priority_boost: default_priority_boost(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout_ms(),
            default_deadline_ms: default_deadline_ms(),
            status_write_attempts: default_status_write_attempts(),
            store_backoff_ms: default_store_backoff_ms(),
        }
    }
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_reaper_interval_ms(),
            stuck_grace_ms: default_stuck_grace_ms(),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_ms: default_gc_interval_ms(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_priority() -> u8 {
    Priority::DEFAULT.get()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    600_000
}

fn default_priority_boost() -> u8 {
    1
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_status_write_attempts() -> u32 {
    5
}

fn default_store_backoff_ms() -> u64 {
    200
}

fn default_reaper_interval_ms() -> u64 {
    15_000
}

fn default_stuck_grace_ms() -> u64 {
    30_000
}

fn default_gc_interval_ms() -> u64 {
    60_000
}

fn default_retention_secs() -> u64 {
    86_400
}

fn default_level() -> String {
    "info".to_string()
}

fn default_format() -> String {
    "pretty".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = ShuttleConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, ShuttleConfig::default());
        assert_eq!(cfg.queue.default_priority, 5);
        assert_eq!(cfg.queue.default_max_attempts, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1_000);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = ShuttleConfig::from_toml_str(
            r#"
            [retry]
            base_delay_ms = 250

            [logging]
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.retry.base_delay_ms, 250);
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.level, "info");
    }

    #[test]
    fn out_of_range_priority_is_rejected() {
        let err = ShuttleConfig::from_toml_str("[queue]\ndefault_priority = 11\n").unwrap_err();
        assert!(matches!(err, QueueError::InvalidPriority(11)));
    }

    #[test]
    fn zero_attempts_is_rejected() {
        let err =
            ShuttleConfig::from_toml_str("[queue]\ndefault_max_attempts = 0\n").unwrap_err();
        assert!(matches!(err, QueueError::InvalidMaxAttempts));
    }

    #[test]
    fn shrinking_multiplier_is_rejected() {
        let err = ShuttleConfig::from_toml_str("[retry]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let err = ShuttleConfig::from_toml_str("[logging]\nformat = \"xml\"\n").unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
    }

    #[test]
    fn durations_are_derived_from_millis() {
        let cfg = ShuttleConfig::default();
        assert_eq!(cfg.worker.poll_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.reaper.stuck_grace(), Duration::from_secs(30));
        assert_eq!(cfg.gc.retention(), Duration::from_secs(86_400));
    }
}
