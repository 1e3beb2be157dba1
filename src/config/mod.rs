//! Typed configuration.
//!
//! Process settings come from environment variables. `DATABASE_URL` is
//! demanded only by callers that talk to Postgres. Tuning for the bus and
//! the queue lives in an optional TOML file; every field has a default.

pub mod secrets;

use crate::error::{Error, Result};
use crate::model::RetryPolicy;
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// Optional path to a [`SystemConfig`] TOML file.
    pub events_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            events_config: std::env::var("EVENTS_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// The Postgres URL, or a config error if `DATABASE_URL` was not set.
    pub fn database_url(&self) -> Result<&SecretString> {
        self.database_url.as_ref().ok_or_else(|| {
            Error::Config("required environment variable DATABASE_URL is not set".to_string())
        })
    }

    /// The system config named by `EVENTS_CONFIG`, or defaults.
    pub fn system_config(&self) -> Result<SystemConfig> {
        match &self.events_config {
            Some(path) => SystemConfig::load(path),
            None => Ok(SystemConfig::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// System tuning
// ---------------------------------------------------------------------------

/// Tuning for one event bus and its task queue.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SystemConfig {
    pub bus: BusConfig,
    pub queue: QueueConfig,
}

impl SystemConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Config(format!("bad events config: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read events config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BusConfig {
    /// Pause between sweeps for undispatched events.
    pub sweep_interval_ms: u64,
    /// How long a `pending` event is left to the live path before the sweep takes it.
    pub pending_grace_ms: u64,
    /// Events claimed per sweep.
    pub sweep_batch: usize,
    /// A `processing` claim older than this is presumed dead and re-dispatched.
    pub stale_after_ms: u64,
    /// Handlers still running after this are aborted and the attempt fails.
    /// Capped at three quarters of `stale_after_ms`.
    pub dispatch_timeout_ms: u64,
    /// Wait before re-opening a failed change stream.
    pub reconnect_delay_ms: u64,
    /// Dispatches allowed to run at once across both paths.
    pub max_inflight_dispatches: usize,
    /// Upper bound on how long `stop` waits for in-flight dispatches.
    pub stop_timeout_ms: u64,
    pub retention_days: u64,
    pub purge_interval_ms: u64,
    /// Buffer of the dispatched-event broadcast stream.
    pub stream_capacity: usize,
    /// Delivery retry policy for failed dispatches.
    pub delivery: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            pending_grace_ms: 5_000,
            sweep_batch: 10,
            stale_after_ms: 300_000,
            dispatch_timeout_ms: 120_000,
            reconnect_delay_ms: 5_000,
            max_inflight_dispatches: 64,
            stop_timeout_ms: 5_000,
            retention_days: 30,
            purge_interval_ms: 3_600_000,
            stream_capacity: 1024,
            delivery: RetryPolicy::delivery(),
        }
    }
}

impl BusConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn pending_grace(&self) -> Duration {
        Duration::from_millis(self.pending_grace_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        let cap = self.stale_after_ms.saturating_mul(3) / 4;
        Duration::from_millis(self.dispatch_timeout_ms.min(cap).max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Ceiling on concurrently executing task handlers.
    pub max_concurrent_tasks: usize,
    /// Per-invocation handler timeout.
    pub task_timeout_ms: u64,
    /// How long a delivery waits for a free slot before reporting the queue full.
    pub admission_timeout_ms: u64,
    /// How long `stop` waits for active tasks.
    pub drain_timeout_ms: u64,
    pub monitor_interval_ms: u64,
    /// Maximum cached task results.
    pub result_capacity: u64,
    /// Cached task results expire after this long.
    pub result_ttl_secs: u64,
    pub workflow_poll_interval_ms: u64,
    /// Task-level retry policy per task type. Absent types never retry.
    pub retry: HashMap<String, RetryPolicy>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 10,
            task_timeout_ms: 300_000,
            admission_timeout_ms: 2_000,
            drain_timeout_ms: 1_000,
            monitor_interval_ms: 1_000,
            result_capacity: 10_000,
            result_ttl_secs: 3_600,
            workflow_poll_interval_ms: 500,
            retry: HashMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn workflow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.workflow_poll_interval_ms)
    }

    /// Configured policy for `task_type`, or no retries.
    pub fn retry_policy(&self, task_type: &str) -> RetryPolicy {
        self.retry.get(task_type).copied().unwrap_or_default()
    }
}
