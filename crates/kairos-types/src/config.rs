//! Site configuration types for Kairos.
//!
//! `SiteConfig` represents the top-level `config.toml` that controls storage,
//! executor concurrency, backoff bounds, schedule polling and logging.

use serde::{Deserialize, Serialize};

/// Top-level configuration for a Kairos site.
///
/// Loaded from `~/.kairos/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// SQLite database URL. `None` means the default under the data directory.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Time zone used when neither the workflow nor the archive declares one.
    #[serde(default = "default_time_zone")]
    pub default_time_zone: String,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub schedule: ScheduleExecutorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            default_time_zone: default_time_zone(),
            executor: ExecutorConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleExecutorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Task dispatch settings for the workflow executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on operators running at the same time.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// How long the server-mode loop sleeps when nothing is dispatchable.
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
}

fn default_max_concurrent_tasks() -> usize {
    8
}

fn default_idle_poll_interval_ms() -> u64 {
    1000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent_tasks(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
        }
    }
}

/// Exponential backoff bounds, in seconds.
///
/// Used for task-level retries and by operators that retry transient
/// backend errors internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_interval_secs")]
    pub initial_interval_secs: u64,

    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

fn default_initial_interval_secs() -> u64 {
    1
}

fn default_max_interval_secs() -> u64 {
    30
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_secs: default_initial_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

/// Background schedule polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleExecutorConfig {
    #[serde(default = "default_schedule_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Maximum due schedules fired in one pass.
    #[serde(default = "default_schedule_batch_size")]
    pub batch_size: u32,
}

fn default_schedule_poll_interval_secs() -> u64 {
    10
}

fn default_schedule_batch_size() -> u32 {
    32
}

impl Default for ScheduleExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_schedule_poll_interval_secs(),
            batch_size: default_schedule_batch_size(),
        }
    }
}

/// Logging output settings consumed by `kairos-observe`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset (e.g. "info", "kairos_core=debug").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,

    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            otel: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_config_default_values() {
        let config = SiteConfig::default();
        assert!(config.database_url.is_none());
        assert_eq!(config.default_time_zone, "UTC");
        assert_eq!(config.executor.max_concurrent_tasks, 8);
        assert_eq!(config.retry.initial_interval_secs, 1);
        assert_eq!(config.retry.max_interval_secs, 30);
        assert_eq!(config.schedule.poll_interval_secs, 10);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_site_config_deserialize_empty() {
        let config: SiteConfig = toml::from_str("").unwrap();
        assert_eq!(config.executor.max_concurrent_tasks, 8);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_site_config_deserialize_with_values() {
        let toml_str = r#"
database_url = "sqlite:///tmp/kairos.db"
default_time_zone = "Asia/Tokyo"

[executor]
max_concurrent_tasks = 2

[retry]
max_interval_secs = 60

[logging]
level = "debug"
json = true
"#;
        let config: SiteConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite:///tmp/kairos.db"));
        assert_eq!(config.default_time_zone, "Asia/Tokyo");
        assert_eq!(config.executor.max_concurrent_tasks, 2);
        assert_eq!(config.executor.idle_poll_interval_ms, 1000);
        assert_eq!(config.retry.initial_interval_secs, 1);
        assert_eq!(config.retry.max_interval_secs, 60);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }
}
