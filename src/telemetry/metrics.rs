//! Metric instrument factories for gateway-events.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created lazily from the `"gateway-events"` meter.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for gateway-events instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("gateway-events")
}

/// Counter: events written to the store.
/// Labels: `event_type`, `result` ("ok" | "error").
pub fn events_published() -> Counter<u64> {
    meter()
        .u64_counter("gateway.events.published")
        .with_description("Number of events published")
        .build()
}

/// Counter: finished dispatch attempts.
/// Labels: `event_type`, `outcome` ("completed" | "retrying" | "failed").
pub fn event_dispatches() -> Counter<u64> {
    meter()
        .u64_counter("gateway.events.dispatches")
        .with_description("Number of event dispatch attempts by outcome")
        .build()
}

/// Counter: claims lost to another dispatcher.
/// Labels: `path` ("live" | "sweep").
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("gateway.events.claim_conflicts")
        .with_description("Dispatch claims that lost the race")
        .build()
}

/// Counter: events removed by retention.
pub fn events_purged() -> Counter<u64> {
    meter()
        .u64_counter("gateway.events.purged")
        .with_description("Events deleted by the retention sweep")
        .build()
}

/// Counter: task executions by outcome.
/// Labels: `task_type`, `outcome` ("completed" | "failed").
pub fn tasks_finished() -> Counter<u64> {
    meter()
        .u64_counter("gateway.tasks.finished")
        .with_description("Number of tasks finished")
        .build()
}

/// Counter: task deliveries refused by admission control.
/// Labels: `reason` ("full" | "stopped").
pub fn task_rejections() -> Counter<u64> {
    meter()
        .u64_counter("gateway.tasks.rejections")
        .with_description("Task deliveries refused by admission control")
        .build()
}

/// Up/down counter: tasks currently executing.
pub fn active_tasks() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("gateway.tasks.active")
        .with_description("Tasks currently executing")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `operation` ("event.dispatch" | "task.execute").
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("gateway.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
