//! Durable event storage.
//!
//! The bus talks to storage only through [`EventStore`]. Every status write
//! is a single conditional update keyed by event id, so two dispatchers
//! racing on the same event cannot both win.

pub mod memory;
pub mod postgres;

pub use memory::MemoryEventStore;
pub use postgres::PgEventStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::model::{Event, EventId, EventQuery, EventStatus, EventType};

/// Position in the store's insertion order. Strictly increasing.
pub type Cursor = i64;

/// One insert observed by a [`EventStore::watch`] stream.
#[derive(Debug, Clone)]
pub struct ChangeNotice {
    pub cursor: Cursor,
    pub event: Event,
}

/// Stream of inserts in cursor order. Ends when the backend gives up;
/// callers re-watch from the last cursor they saw.
pub type ChangeStream = mpsc::Receiver<Result<ChangeNotice>>;

/// Terminal or retry write applied to an event currently `processing`.
#[derive(Debug, Clone)]
pub enum StatusChange {
    Completed,
    Retrying {
        retry_count: u32,
        error: String,
        retry_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
}

impl StatusChange {
    pub fn status(&self) -> EventStatus {
        match self {
            StatusChange::Completed => EventStatus::Completed,
            StatusChange::Retrying { .. } => EventStatus::Retrying,
            StatusChange::Failed { .. } => EventStatus::Failed,
        }
    }
}

/// Error recorded when a `processing` claim is taken over after going stale.
pub const STALE_CLAIM_ERROR: &str = "dispatch abandoned: claim went stale";

/// Number of events with a given type and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCount {
    pub event_type: EventType,
    pub status: EventStatus,
    pub count: u64,
}

/// Storage contract consumed by the event bus.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Create indices and record the retention window. Idempotent.
    async fn prepare(&self, retention: Duration) -> Result<()>;

    /// Append an event. Returns its cursor.
    async fn insert(&self, event: &Event) -> Result<Cursor>;

    async fn get(&self, id: EventId) -> Result<Option<Event>>;

    /// Historical query, newest first.
    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>>;

    /// Events the sweep may dispatch, highest priority then oldest first:
    /// `pending` older than `pending_grace`, `retrying` whose `retry_at` has
    /// passed, and `processing` claims untouched for `stale_after`.
    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        pending_grace: Duration,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<Event>>;

    /// Atomically move a dispatchable event to `processing`.
    ///
    /// Taking over a stale `processing` claim counts as a failed attempt:
    /// `retry_count` goes up, and once it has reached `max_retries` the
    /// event is marked `failed` instead of claimed.
    ///
    /// Returns false when the event is not dispatchable any more (already
    /// claimed, terminal, its retry is not due yet, or it was just failed
    /// for abandoned claims).
    async fn claim(
        &self,
        id: EventId,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<bool>;

    /// Apply `change` if the event is still `processing`.
    async fn transition(&self, id: EventId, change: StatusChange) -> Result<bool>;

    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Tail inserts with a cursor greater than `resume_after`. `None`
    /// starts at the current end of the log.
    async fn watch(&self, resume_after: Option<Cursor>) -> Result<ChangeStream>;

    /// Delete events older than `before`. Returns how many were removed.
    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// `now - d`, saturating at the earliest representable time.
pub(crate) fn time_before(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// `now + d`, saturating at the latest representable time.
pub(crate) fn time_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
