//! Adapters that turn domain requests into queued tasks and published events.

use serde::Serialize;
use serde_json::{Value, json};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::bus::EventBus;
use crate::error::Result;
use crate::model::{Event, EventId, EventType, Priority, TaskResult};
use crate::queue::{TaskQueue, TaskRequest};

/// Task type executed by [`ToolExecutor`].
pub const TOOL_EXECUTION: &str = "tool_execution";

/// Task type executed by [`MemoryManager`].
pub const MEMORY_UPDATE: &str = "memory_update";

const DEFAULT_WAIT: Duration = Duration::from_secs(60);

/// Result of [`ToolExecutor::execute_tool`].
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Finished(TaskResult),
    /// Not waited for; poll with the task id.
    Queued(EventId),
}

/// Runs tools as `tool_execution` tasks.
#[derive(Clone)]
pub struct ToolExecutor {
    queue: TaskQueue,
    wait_timeout: Duration,
}

impl ToolExecutor {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            wait_timeout: DEFAULT_WAIT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub async fn execute_tool(
        &self,
        tool_name: &str,
        tool_args: Value,
        priority: Priority,
        wait: bool,
    ) -> Result<ToolOutcome> {
        let request = TaskRequest::new(
            TOOL_EXECUTION,
            json!({
                "tool_name": tool_name,
                "tool_args": tool_args,
            }),
        )
        .priority(priority);
        let task_id = self.queue.submit(request).await?;
        debug!(%task_id, tool_name, "queued tool execution");

        if !wait {
            return Ok(ToolOutcome::Queued(task_id));
        }
        let result = self.queue.wait_for_task(task_id, self.wait_timeout).await?;
        Ok(ToolOutcome::Finished(result))
    }
}

/// Stores and retrieves memories through `memory_update` tasks.
#[derive(Clone)]
pub struct MemoryManager {
    queue: TaskQueue,
    wait_timeout: Duration,
}

impl MemoryManager {
    pub fn new(queue: TaskQueue) -> Self {
        Self {
            queue,
            wait_timeout: DEFAULT_WAIT,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    /// Queue a store at low priority. With `wait`, returns only after the
    /// task has finished.
    pub async fn store_memory(
        &self,
        content: &str,
        metadata: Option<Value>,
        wait: bool,
    ) -> Result<EventId> {
        let request = TaskRequest::new(
            MEMORY_UPDATE,
            json!({
                "operation": "store",
                "content": content,
                "metadata": metadata.unwrap_or_else(|| json!({})),
            }),
        )
        .priority(Priority::Low);
        let task_id = self.queue.submit(request).await?;
        if wait {
            self.queue.wait_for_task(task_id, self.wait_timeout).await?;
        }
        Ok(task_id)
    }

    /// Queue a retrieval at high priority and wait for its result.
    pub async fn retrieve_memories(&self, query: &str, limit: usize) -> Result<TaskResult> {
        let request = TaskRequest::new(
            MEMORY_UPDATE,
            json!({
                "operation": "retrieve",
                "query": query,
                "limit": limit,
            }),
        )
        .priority(Priority::High);
        let task_id = self.queue.submit(request).await?;
        self.queue.wait_for_task(task_id, self.wait_timeout).await
    }
}

/// Translates Slack payloads into bus events.
#[derive(Clone)]
pub struct SlackEventAdapter {
    bus: EventBus,
}

impl SlackEventAdapter {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub async fn handle_slack_message(&self, payload: &Value) -> Result<EventId> {
        let field = |name: &str| payload.get(name).cloned().unwrap_or(Value::Null);
        let event = Event::new(
            EventType::SlackMessageReceived,
            "slack",
            json!({
                "channel": field("channel"),
                "user": field("user"),
                "text": field("text"),
                "ts": field("ts"),
                "thread_ts": field("thread_ts"),
            }),
        )
        .priority(Priority::Medium);
        self.bus.publish(event).await
    }

    pub async fn handle_slack_command(&self, command: &str, args: Value) -> Result<EventId> {
        let channel = args.get("channel_id").cloned().unwrap_or(Value::Null);
        let user = args.get("user_id").cloned().unwrap_or(Value::Null);
        let event = Event::new(
            EventType::SlackCommandReceived,
            "slack",
            json!({
                "command": command,
                "args": args,
                "channel": channel,
                "user": user,
            }),
        )
        .priority(Priority::High);
        self.bus.publish(event).await
    }
}

/// Run `fut`, publishing an `integration.event` before it starts and another
/// carrying its output once it finishes.
pub async fn publish_around<F, T>(bus: &EventBus, name: &str, args: Value, fut: F) -> Result<T>
where
    F: Future<Output = T>,
    T: Serialize,
{
    bus.publish(Event::new(
        EventType::IntegrationEvent,
        "wrapper",
        json!({
            "function": name,
            "args": args,
        }),
    ))
    .await?;

    let output = fut.await;

    bus.publish(Event::new(
        EventType::IntegrationEvent,
        "wrapper",
        json!({
            "function": name,
            "status": "completed",
            "result": serde_json::to_value(&output)?,
        }),
    ))
    .await?;
    Ok(output)
}
