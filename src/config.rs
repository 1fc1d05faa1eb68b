//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Worker loop and lock discipline tunables.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkerConfig {
    /// Seconds between scheduler scans of all sessions.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Hard execution timeout for one task run.
    #[serde(default = "default_task_timeout_seconds")]
    pub task_timeout_seconds: u64,
    /// Minutes a task may sit `awaiting_response` before it is failed.
    #[serde(default = "default_staleness_minutes")]
    pub awaiting_staleness_minutes: u64,
    /// Session lock acquisition timeout.
    #[serde(default = "default_lock_timeout_seconds")]
    pub lock_timeout_seconds: u64,
    /// Age after which a lock marker is treated as abandoned.
    #[serde(default = "default_lock_stale_seconds")]
    pub lock_stale_seconds: u64,
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_task_timeout_seconds() -> u64 {
    600
}

fn default_staleness_minutes() -> u64 {
    15
}

fn default_lock_timeout_seconds() -> u64 {
    30
}

fn default_lock_stale_seconds() -> u64 {
    300
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            task_timeout_seconds: default_task_timeout_seconds(),
            awaiting_staleness_minutes: default_staleness_minutes(),
            lock_timeout_seconds: default_lock_timeout_seconds(),
            lock_stale_seconds: default_lock_stale_seconds(),
        }
    }
}

/// Process-wide circuit breaker defaults applied to lazily created breakers.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before probing.
    #[serde(default = "default_recovery_timeout_seconds")]
    pub recovery_timeout_seconds: u64,
    /// Probe calls permitted while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout_seconds() -> u64 {
    120
}

fn default_half_open_max_calls() -> u32 {
    1
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout_seconds(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Self-healing deployment verification settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealingConfig {
    /// Health probe target checked after every non-dry-run write.
    pub health_url: String,
    /// Seconds to wait before probing, letting downstream caches settle.
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
    /// Probe request timeout.
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
}

fn default_grace_seconds() -> u64 {
    2
}

fn default_probe_timeout_seconds() -> u64 {
    15
}

/// Retry budgets for the planning/generation collaborator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GenerationConfig {
    /// Endpoint of the planning/generation text service.
    #[serde(default)]
    pub planner_url: Option<String>,
    /// Network-level attempts per planner call.
    #[serde(default = "default_planner_attempts")]
    pub planner_attempts: u32,
    /// Content-level regeneration retries per task.
    #[serde(default = "default_generation_retries")]
    pub max_generation_retries: u32,
    /// Initial retry delay in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
}

fn default_planner_attempts() -> u32 {
    3
}

fn default_generation_retries() -> u32 {
    2
}

fn default_retry_initial_delay_ms() -> u64 {
    2000
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            planner_url: None,
            planner_attempts: default_planner_attempts(),
            max_generation_retries: default_generation_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
        }
    }
}

/// Remote file tree location for the shipped local-filesystem transport.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TransportConfig {
    /// Root of the managed file tree.
    pub remote_root: PathBuf,
}

fn default_http_port() -> u16 {
    8300
}

fn default_retention_days() -> u32 {
    30
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory for the database, lock markers, and file backups.
    pub data_dir: PathBuf,
    /// HTTP port for the submission surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Days a session may sit idle before the retention sweep removes it.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Worker loop tunables.
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Circuit breaker defaults.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Self-healing verification settings.
    pub healing: HealingConfig,
    /// Planner retry budgets.
    #[serde(default)]
    pub generation: GenerationConfig,
    /// Managed file tree location.
    pub transport: TransportConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Path of the `SQLite` database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("filewright.db")
    }

    /// Directory holding first-generation JSON session files (migration input).
    #[must_use]
    pub fn legacy_sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding per-session lock markers.
    #[must_use]
    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("sessions").join(".locks")
    }

    /// Directory holding pre-write file backups.
    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    /// Scheduler scan interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker.poll_interval_seconds)
    }

    /// Hard execution timeout for one task run.
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.task_timeout_seconds)
    }

    /// Staleness threshold for tasks stuck awaiting external input.
    #[must_use]
    pub fn awaiting_staleness(&self) -> Duration {
        Duration::from_secs(self.worker.awaiting_staleness_minutes * 60)
    }

    /// Session lock acquisition timeout.
    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.worker.lock_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.worker.poll_interval_seconds == 0 {
            return Err(AppError::Config(
                "worker.poll_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.worker.task_timeout_seconds == 0 {
            return Err(AppError::Config(
                "worker.task_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "breaker.failure_threshold must be greater than zero".into(),
            ));
        }
        if self.healing.health_url.is_empty() {
            return Err(AppError::Config("healing.health_url must be set".into()));
        }
        if self.generation.retry_backoff_multiplier < 1.0 {
            return Err(AppError::Config(
                "generation.retry_backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}
