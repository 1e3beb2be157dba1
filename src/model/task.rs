//! Task results and retry policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::event::EventId;

/// Outcome of one task's handler invocation. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Equals the id of the `task.queued` event.
    pub task_id: EventId,
    pub task_type: String,
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Time from the first handler invocation to the final outcome,
    /// including retry backoff. Queueing delay is not counted.
    pub duration_ms: u64,
    /// Handler invocations made, including retries.
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

/// Where a task stands from one queue's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    /// Admitted and executing.
    Active,
    Completed(TaskResult),
    Failed(TaskResult),
    /// Never seen here, still queued on the bus, or its result was evicted.
    Unknown,
}

/// How many times to retry and how long to wait between attempts.
///
/// Retry `n` (0-based) waits `backoff × (n + 1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff_ms: backoff.as_millis() as u64,
        }
    }

    /// Fail on the first error.
    pub const fn none() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: 0,
        }
    }

    /// Event delivery default: 3 retries, 5s linear backoff.
    pub const fn delivery() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 5_000,
        }
    }

    /// May an attempt that has already failed `retry_count` times be retried?
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn delay_for(&self, retry_count: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(u64::from(retry_count) + 1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
