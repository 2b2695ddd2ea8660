//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;

use crate::error::ConfigError;
use crate::queue::RetryPolicy;

/// Queue and supervisor configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of workers running at once across all groups.
    pub max_concurrent: usize,
    /// Retries allowed after the first attempt before an item is abandoned.
    pub max_retries: u32,
    /// Per-run deadline; a worker still running after this is terminated.
    pub worker_timeout: Duration,
    /// Coarse wake-up for the scheduler loop in case an event was missed.
    pub safety_wake_interval: Duration,
    /// How long shutdown waits for running workers before killing them.
    pub shutdown_deadline: Duration,
    /// Backoff between retries.
    pub retry: RetryPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_retries: 3,
            worker_timeout: Duration::from_secs(30 * 60),
            safety_wake_interval: Duration::from_secs(5),
            shutdown_deadline: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Read overrides from `CHATLANE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            max_concurrent: env_parse("CHATLANE_MAX_CONCURRENT", defaults.max_concurrent)?,
            max_retries: env_parse("CHATLANE_MAX_RETRIES", defaults.max_retries)?,
            worker_timeout: env_millis("CHATLANE_WORKER_TIMEOUT_MS", defaults.worker_timeout)?,
            safety_wake_interval: env_millis(
                "CHATLANE_SAFETY_WAKE_MS",
                defaults.safety_wake_interval,
            )?,
            shutdown_deadline: env_millis(
                "CHATLANE_SHUTDOWN_DEADLINE_MS",
                defaults.shutdown_deadline,
            )?,
            retry: RetryPolicy {
                base: env_millis("CHATLANE_RETRY_BASE_MS", defaults.retry.base)?,
                cap: env_millis("CHATLANE_RETRY_CAP_MS", defaults.retry.cap)?,
                jitter: env_parse("CHATLANE_RETRY_JITTER", defaults.retry.jitter)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.safety_wake_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "safety_wake_interval".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.worker_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "worker_timeout".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        self.retry.validate()
    }
}

/// Settings for the host binary: routing, worker command and scheduled tasks.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Name the assistant answers to (`@Andy ...`).
    pub assistant_name: String,
    /// Group whose messages are always handled, trigger or not.
    pub main_group: String,
    /// Worker executable started once per admitted run.
    pub worker_program: String,
    pub worker_args: Vec<String>,
    /// JSON file with scheduled task definitions.
    pub tasks_file: Option<PathBuf>,
    /// How often the task ticker looks for due tasks.
    pub task_tick_interval: Duration,
    /// Directory for rolling log files; stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            assistant_name: "Andy".to_string(),
            main_group: "main".to_string(),
            worker_program: "chatlane-agent".to_string(),
            worker_args: Vec::new(),
            tasks_file: None,
            task_tick_interval: Duration::from_secs(60),
            log_dir: None,
        }
    }
}

impl HostConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let assistant_name =
            std::env::var("CHATLANE_ASSISTANT_NAME").unwrap_or(defaults.assistant_name);
        if assistant_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "CHATLANE_ASSISTANT_NAME".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        let worker_args: Vec<String> = std::env::var("CHATLANE_WORKER_ARGS")
            .unwrap_or_default()
            .split_whitespace()
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            assistant_name,
            main_group: std::env::var("CHATLANE_MAIN_GROUP").unwrap_or(defaults.main_group),
            worker_program: std::env::var("CHATLANE_WORKER_PROGRAM")
                .unwrap_or(defaults.worker_program),
            worker_args,
            tasks_file: std::env::var("CHATLANE_TASKS_FILE").ok().map(PathBuf::from),
            task_tick_interval: env_millis("CHATLANE_TASK_TICK_MS", defaults.task_tick_interval)?,
            log_dir: std::env::var("CHATLANE_LOG_DIR").ok().map(PathBuf::from),
        })
    }

    /// Pattern a non-main group message must match to wake the assistant.
    pub fn trigger_pattern(&self) -> Result<Regex, ConfigError> {
        let pattern = format!(r"(?i)^@{}\b", regex::escape(self.assistant_name.trim()));
        Regex::new(&pattern).map_err(|e| ConfigError::InvalidValue {
            key: "assistant_name".to_string(),
            message: e.to_string(),
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    env_parse(key, default_ms).map(Duration::from_millis)
}
