//! Core data model.
//!
//! Events are owned by the store. Task results are owned by the task queue
//! that produced them and never persisted.

pub mod event;
pub mod task;

pub use event::{Event, EventId, EventQuery, EventStatus, EventType, Priority};
pub use task::{RetryPolicy, TaskResult, TaskStatus};
