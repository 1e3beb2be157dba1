//! Span helpers for event dispatch and task execution.

use tracing::Span;

use crate::model::{EventId, EventType};

/// Start a span covering one dispatch of one event.
///
/// `event.status` is declared empty and filled by [`record_state_transition`].
pub fn start_dispatch_span(event_type: EventType, event_id: &EventId, path: &str) -> Span {
    tracing::info_span!(
        "event.dispatch",
        "event.type" = event_type.as_str(),
        "event.id" = %event_id,
        "dispatch.path" = path,
        "event.status" = tracing::field::Empty,
    )
}

/// Start a span covering one task execution.
pub fn start_task_span(task_type: &str, task_id: &EventId) -> Span {
    tracing::info_span!(
        "task.execute",
        "task.type" = task_type,
        "task.id" = %task_id,
        "task.outcome" = tracing::field::Empty,
    )
}

/// Record a state transition event on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("event.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
