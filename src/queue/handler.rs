use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;

use crate::model::{Event, Priority};

/// Executes one task type. Receives the task's `task_data` payload and
/// returns the task result.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task_data: Value) -> anyhow::Result<Value>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn run(&self, task_data: Value) -> anyhow::Result<Value> {
        (self)(task_data).await
    }
}

/// A task to submit, with optional priority and correlation id.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub task_type: String,
    pub task_data: Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, task_data: Value) -> Self {
        Self {
            task_type: task_type.into(),
            task_data,
            priority: Priority::Medium,
            correlation_id: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn into_event(self) -> Event {
        Event::task(self.task_type, self.task_data)
            .priority(self.priority)
            .maybe_correlation_id(self.correlation_id)
    }
}
