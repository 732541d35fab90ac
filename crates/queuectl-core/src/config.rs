use std::path::PathBuf;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_BACKOFF_BASE: u32 = 2;
pub const MIN_BACKOFF_BASE: u32 = 2;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_PRIORITY: i64 = 1;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_RECLAIM_AFTER_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 64_000;

/// Top-level config (queuectl.toml + QUEUECTL_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueuectlConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a connection waits on a locked database before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

/// Retry policy and enqueue defaults, read once when the job store is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Exponential backoff base: a failed attempt `n` waits `backoff_base^n` seconds.
    /// Values below 2 are raised to 2.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: u32,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_priority")]
    pub default_priority: i64,
    /// 0 means unbounded.
    #[serde(default)]
    pub default_timeout_secs: u64,
    /// Captured job output above this size is stored with the middle omitted.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff_base: DEFAULT_BACKOFF_BASE,
            default_max_retries: DEFAULT_MAX_RETRIES,
            default_priority: DEFAULT_PRIORITY,
            default_timeout_secs: 0,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

impl QueueConfig {
    pub fn effective_backoff_base(&self) -> u32 {
        self.backoff_base.max(MIN_BACKOFF_BASE)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of workers started by `worker start` when `--count` is omitted.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Sleep between claim attempts when the queue has nothing eligible.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Telemetry cadence while a job is running.
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// Jobs held by a worker that has been silent this long are handed back
    /// to the queue. 0 disables the sweep.
    #[serde(default = "default_reclaim_after_secs")]
    pub reclaim_after_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_logs_dir")]
    pub logs_dir: String,
    /// File whose appearance asks every running worker to drain and exit.
    #[serde(default = "default_stop_marker")]
    pub stop_marker: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            sample_interval_ms: DEFAULT_SAMPLE_INTERVAL_MS,
            reclaim_after_secs: DEFAULT_RECLAIM_AFTER_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            logs_dir: default_logs_dir(),
            stop_marker: default_stop_marker(),
        }
    }
}

fn default_backoff_base() -> u32 {
    DEFAULT_BACKOFF_BASE
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_worker_count() -> usize {
    1
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_sample_interval_ms() -> u64 {
    DEFAULT_SAMPLE_INTERVAL_MS
}
fn default_reclaim_after_secs() -> u64 {
    DEFAULT_RECLAIM_AFTER_SECS
}
fn default_shutdown_grace_secs() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECS
}
fn default_db_path() -> String {
    base_dir().join("queuectl.db").display().to_string()
}
fn default_logs_dir() -> String {
    base_dir().join("logs").display().to_string()
}
fn default_stop_marker() -> String {
    base_dir().join("stop.flag").display().to_string()
}

/// `~/.queuectl`, or `./.queuectl` when `HOME` is unset.
pub fn base_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".queuectl")
}

impl QueuectlConfig {
    /// Load config from a TOML file with QUEUECTL_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `QUEUECTL_QUEUE__BACKOFF_BASE=3` or `QUEUECTL_WORKER__COUNT=4`.
    /// A missing file is not an error; every field has a default.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(%path, "loading config");

        let config: QueuectlConfig = Figment::from(Serialized::defaults(QueuectlConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("QUEUECTL_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    base_dir().join("queuectl.toml").display().to_string()
}
