//! Event records: the unit of record on the bus.
//!
//! An event is persisted once with `status = pending` and then walks the
//! dispatch state machine until it is `completed` or `failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A durable event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier, assigned at construction.
    pub event_id: EventId,

    /// Routing key for handlers.
    pub event_type: EventType,

    /// Producer identifier ("task_queue", "slack", a connector name...).
    pub source: String,

    /// Type-specific payload. The bus never interprets it.
    pub data: Value,

    pub timestamp: DateTime<Utc>,

    /// Groups related events, e.g. all sub-tasks of one workflow.
    pub correlation_id: Option<String>,

    pub priority: Priority,

    pub status: EventStatus,

    /// Failed dispatch attempts so far.
    pub retry_count: u32,

    /// Last dispatch failure.
    pub error: Option<String>,

    pub metadata: Value,

    /// Earliest time a `retrying` event may be dispatched again.
    pub retry_at: Option<DateTime<Utc>>,

    /// When the event reached a terminal status.
    pub processed_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn new(event_type: EventType, source: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: EventId::new(),
            event_type,
            source: source.into(),
            data,
            timestamp: Utc::now(),
            correlation_id: None,
            priority: Priority::Medium,
            status: EventStatus::Pending,
            retry_count: 0,
            error: None,
            metadata: json!({}),
            retry_at: None,
            processed_at: None,
        }
    }

    /// A `task.queued` event carrying a task type and its payload.
    pub fn task(task_type: impl Into<String>, task_data: Value) -> Self {
        Self::new(
            EventType::TaskQueued,
            "task_queue",
            json!({
                "task_type": task_type.into(),
                "task_data": task_data,
            }),
        )
    }

    /// A `workflow.initiated` event. The workflow id doubles as correlation id.
    pub fn workflow(
        workflow_id: impl Into<String>,
        workflow_type: impl Into<String>,
        steps: Vec<Value>,
    ) -> Self {
        let workflow_id = workflow_id.into();
        Self::new(
            EventType::WorkflowInitiated,
            "workflow_engine",
            json!({
                "workflow_id": workflow_id,
                "workflow_type": workflow_type.into(),
                "steps": steps,
                "current_step": 0,
            }),
        )
        .correlation_id(workflow_id)
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn maybe_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// The `task_type` field of a task event's payload.
    pub fn task_type(&self) -> Option<&str> {
        self.data.get("task_type").and_then(Value::as_str)
    }
}

/// Newtype for event IDs. Task ids are event ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse()
            .map(EventId)
            .map_err(|e| Error::Other(format!("invalid event id {s}: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Event type
// ---------------------------------------------------------------------------

macro_rules! event_types {
    ($($variant:ident => $name:literal,)+) => {
        /// Closed set of event types. Wire names are dotted strings.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum EventType {
            $(#[serde(rename = $name)] $variant,)+
        }

        impl EventType {
            pub const ALL: &'static [EventType] = &[$(EventType::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(EventType::$variant => $name,)+
                }
            }
        }

        impl std::str::FromStr for EventType {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok(EventType::$variant),)+
                    _ => Err(Error::Other(format!("unknown event type: {s}"))),
                }
            }
        }
    };
}

event_types! {
    // Task lifecycle
    TaskQueued => "task.queued",
    TaskStarted => "task.started",
    TaskCompleted => "task.completed",
    TaskFailed => "task.failed",
    WorkflowInitiated => "workflow.initiated",
    UserRequestReceived => "user.request.received",

    // Tool execution
    ToolExecutionRequested => "tool.execution.requested",
    ToolExecutionStarted => "tool.execution.started",
    ToolExecutionCompleted => "tool.execution.completed",
    ToolExecutionFailed => "tool.execution.failed",

    // Memory
    MemoryUpdateQueued => "memory.update.queued",
    MemoryIndexed => "memory.indexed",
    MemoryRetrieved => "memory.retrieved",
    MemoryAnalyzed => "memory.analyzed",

    // Integrations
    SlackMessageReceived => "slack.message.received",
    SlackCommandReceived => "slack.command.received",
    SlackResponseReady => "slack.response.ready",
    WebhookReceived => "webhook.received",
    IntegrationEvent => "integration.event",

    // Connectors
    ConnectorEvent => "connector.event",
    EmailEvent => "email.event",
    CalendarEvent => "calendar.event",
    TaskEvent => "task.event",
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Advisory processing priority. Only the sweep honours it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank, higher = more urgent. Stores sort on this.
    pub fn rank(self) -> i16 {
        match self {
            Priority::Critical => 3,
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }

    pub fn from_rank(rank: i16) -> Result<Self> {
        match rank {
            3 => Ok(Priority::Critical),
            2 => Ok(Priority::High),
            1 => Ok(Priority::Medium),
            0 => Ok(Priority::Low),
            _ => Err(Error::Other(format!("unknown priority rank: {rank}"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(Error::Other(format!("unknown priority: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Dispatch status of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Stored, not yet claimed by a dispatcher.
    Pending,
    /// Claimed by a dispatcher, handlers running.
    Processing,
    /// All handlers succeeded. Terminal.
    Completed,
    /// Retries exhausted. Terminal.
    Failed,
    /// Dispatch failed, waiting for `retry_at`.
    Retrying,
}

impl EventStatus {
    pub const ALL: &'static [EventStatus] = &[
        EventStatus::Pending,
        EventStatus::Processing,
        EventStatus::Completed,
        EventStatus::Failed,
        EventStatus::Retrying,
    ];

    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Retrying, Processing)     // re-dispatch once retry_at passed
                | (Processing, Processing)   // stale claim taken over
                | (Processing, Completed)
                | (Processing, Retrying)
                | (Processing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Retrying => "retrying",
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            "retrying" => Ok(EventStatus::Retrying),
            _ => Err(Error::Other(format!("unknown status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Filters for historical event queries. Results are newest first.
#[derive(Debug, Clone)]
pub struct EventQuery {
    pub event_type: Option<EventType>,
    pub correlation_id: Option<String>,
    pub status: Option<EventStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            correlation_id: None,
            status: None,
            start_time: None,
            end_time: None,
            limit: 100,
        }
    }
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn since(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn until(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Does `event` satisfy every filter? Used by backends without a query engine.
    pub fn matches(&self, event: &Event) -> bool {
        self.event_type.is_none_or(|t| event.event_type == t)
            && self
                .correlation_id
                .as_deref()
                .is_none_or(|c| event.correlation_id.as_deref() == Some(c))
            && self.status.is_none_or(|s| event.status == s)
            && self.start_time.is_none_or(|t| event.timestamp >= t)
            && self.end_time.is_none_or(|t| event.timestamp <= t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names_round_trip() {
        for t in EventType::ALL {
            let parsed: EventType = t.as_str().parse().unwrap();
            assert_eq!(parsed, *t);
        }
        assert_eq!(
            serde_json::to_string(&EventType::TaskQueued).unwrap(),
            "\"task.queued\""
        );
        assert!("task.exploded".parse::<EventType>().is_err());
    }

    #[test]
    fn terminal_statuses_never_leave() {
        for to in EventStatus::ALL {
            assert!(!EventStatus::Completed.can_transition_to(*to));
            assert!(!EventStatus::Failed.can_transition_to(*to));
        }
        assert!(!EventStatus::Pending.can_transition_to(EventStatus::Completed));
        assert!(EventStatus::Retrying.can_transition_to(EventStatus::Processing));
    }

    #[test]
    fn task_event_carries_type_and_payload() {
        let event = Event::task("echo", json!({"x": 21})).priority(Priority::High);
        assert_eq!(event.event_type, EventType::TaskQueued);
        assert_eq!(event.source, "task_queue");
        assert_eq!(event.task_type(), Some("echo"));
        assert_eq!(event.data["task_data"]["x"], 21);
        assert_eq!(event.status, EventStatus::Pending);
        assert_eq!(event.priority, Priority::High);
    }

    #[test]
    fn workflow_event_is_correlated_by_workflow_id() {
        let event = Event::workflow("wf-7", "onboarding", vec![json!("a"), json!("b")]);
        assert_eq!(event.correlation_id.as_deref(), Some("wf-7"));
        assert_eq!(event.data["current_step"], 0);
    }

    #[test]
    fn priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() > Priority::High.rank());
        assert!(Priority::Medium.rank() > Priority::Low.rank());
        assert_eq!(Priority::from_rank(2).unwrap(), Priority::High);
    }

    #[test]
    fn query_matches_on_every_filter() {
        let event = Event::new(EventType::EmailEvent, "gmail", json!({})).correlation_id("c1");
        assert!(EventQuery::new().matches(&event));
        assert!(EventQuery::new().correlation_id("c1").matches(&event));
        assert!(!EventQuery::new().correlation_id("c2").matches(&event));
        assert!(!EventQuery::new().event_type(EventType::TaskFailed).matches(&event));
        assert!(!EventQuery::new().status(EventStatus::Completed).matches(&event));
    }
}
