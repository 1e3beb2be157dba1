//! In-process event store.
//!
//! Same semantics as the Postgres store, no durability. Used by tests and by
//! `gateway-events serve --memory`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use super::{
    ChangeNotice, ChangeStream, Cursor, EventStore, STALE_CLAIM_ERROR, StatusChange, StatusCount,
    time_before,
};
use crate::error::{Error, Result};
use crate::model::{Event, EventId, EventQuery, EventStatus};

const WATCH_BUFFER: usize = 256;

#[derive(Debug, Clone)]
struct Row {
    event: Event,
    updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct State {
    rows: BTreeMap<Cursor, Row>,
    by_id: HashMap<EventId, Cursor>,
    next_cursor: Cursor,
    retention: Option<Duration>,
}

struct Shared {
    state: Mutex<State>,
    inserted: Notify,
    available: AtomicBool,
}

/// Event store held entirely in memory. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryEventStore {
    shared: Arc<Shared>,
}

impl Default for MemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    rows: BTreeMap::new(),
                    by_id: HashMap::new(),
                    next_cursor: 1,
                    retention: None,
                }),
                inserted: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Retention window recorded by `prepare`, if any.
    pub fn retention(&self) -> Option<Duration> {
        self.state().map(|s| s.retention).unwrap_or(None)
    }

    pub fn len(&self) -> usize {
        self.state().map(|s| s.rows.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(Error::Store("memory store unavailable".to_string()));
        }
        self.shared
            .state
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".to_string()))
    }
}

fn is_claimable(row: &Row, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match row.event.status {
        EventStatus::Pending => true,
        EventStatus::Retrying => row.event.retry_at.is_none_or(|t| t <= now),
        EventStatus::Processing => row.updated_at <= time_before(now, stale_after),
        EventStatus::Completed | EventStatus::Failed => false,
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn prepare(&self, retention: Duration) -> Result<()> {
        self.state()?.retention = Some(retention);
        Ok(())
    }

    async fn insert(&self, event: &Event) -> Result<Cursor> {
        let cursor = {
            let mut state = self.state()?;
            if state.by_id.contains_key(&event.event_id) {
                return Err(Error::Store(format!(
                    "duplicate event id {}",
                    event.event_id
                )));
            }
            let cursor = state.next_cursor;
            state.next_cursor += 1;
            state.by_id.insert(event.event_id, cursor);
            state.rows.insert(
                cursor,
                Row {
                    event: event.clone(),
                    updated_at: Utc::now(),
                },
            );
            cursor
        };
        self.shared.inserted.notify_waiters();
        Ok(cursor)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>> {
        let state = self.state()?;
        Ok(state
            .by_id
            .get(&id)
            .and_then(|c| state.rows.get(c))
            .map(|row| row.event.clone()))
    }

    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let state = self.state()?;
        let mut events: Vec<Event> = state
            .rows
            .values()
            .filter(|row| query.matches(&row.event))
            .map(|row| row.event.clone())
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(query.limit);
        Ok(events)
    }

    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        pending_grace: Duration,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let grace_cutoff = time_before(now, pending_grace);
        let state = self.state()?;
        let mut events: Vec<Event> = state
            .rows
            .values()
            .filter(|row| match row.event.status {
                EventStatus::Pending => row.event.timestamp <= grace_cutoff,
                _ => is_claimable(row, now, stale_after),
            })
            .map(|row| row.event.clone())
            .collect();
        events.sort_by(|a, b| {
            b.priority
                .rank()
                .cmp(&a.priority.rank())
                .then(a.timestamp.cmp(&b.timestamp))
        });
        events.truncate(limit);
        Ok(events)
    }

    async fn claim(
        &self,
        id: EventId,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let Some(cursor) = state.by_id.get(&id).copied() else {
            return Ok(false);
        };
        let Some(row) = state.rows.get_mut(&cursor) else {
            return Ok(false);
        };
        if !is_claimable(row, now, stale_after) {
            return Ok(false);
        }
        row.updated_at = now;

        if row.event.status == EventStatus::Processing {
            row.event.error = Some(STALE_CLAIM_ERROR.to_string());
            if row.event.retry_count >= max_retries {
                row.event.status = EventStatus::Failed;
                row.event.processed_at = Some(now);
                warn!(
                    event_id = %id,
                    retry_count = row.event.retry_count,
                    "stale claim abandoned, event failed"
                );
                return Ok(false);
            }
            row.event.retry_count += 1;
            warn!(
                event_id = %id,
                retry_count = row.event.retry_count,
                "taking over stale claim"
            );
        }
        row.event.status = EventStatus::Processing;
        Ok(true)
    }

    async fn transition(&self, id: EventId, change: StatusChange) -> Result<bool> {
        let mut state = self.state()?;
        let Some(cursor) = state.by_id.get(&id).copied() else {
            return Ok(false);
        };
        let Some(row) = state.rows.get_mut(&cursor) else {
            return Ok(false);
        };
        if !row.event.status.can_transition_to(change.status()) {
            return Ok(false);
        }

        let now = Utc::now();
        row.updated_at = now;
        row.event.status = change.status();
        match change {
            StatusChange::Completed => {
                row.event.processed_at = Some(now);
            }
            StatusChange::Retrying {
                retry_count,
                error,
                retry_at,
            } => {
                row.event.retry_count = retry_count;
                row.event.error = Some(error);
                row.event.retry_at = Some(retry_at);
            }
            StatusChange::Failed { error } => {
                row.event.error = Some(error);
                row.event.processed_at = Some(now);
            }
        }
        Ok(true)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let state = self.state()?;
        let mut counts: BTreeMap<_, u64> = BTreeMap::new();
        for row in state.rows.values() {
            *counts
                .entry((row.event.event_type, row.event.status))
                .or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|((event_type, status), count)| StatusCount {
                event_type,
                status,
                count,
            })
            .collect())
    }

    async fn watch(&self, resume_after: Option<Cursor>) -> Result<ChangeStream> {
        let mut cursor = match resume_after {
            Some(c) => c,
            None => self.state()?.next_cursor - 1,
        };
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let store = self.clone();

        tokio::spawn(async move {
            loop {
                // Register interest before reading so an insert between the
                // read and the wait is not lost.
                let notified = store.shared.inserted.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let batch: Result<Vec<ChangeNotice>> = store.state().map(|state| {
                    state
                        .rows
                        .range(cursor + 1..)
                        .map(|(c, row)| ChangeNotice {
                            cursor: *c,
                            event: row.event.clone(),
                        })
                        .collect()
                });

                match batch {
                    Ok(batch) => {
                        for notice in batch {
                            cursor = notice.cursor;
                            if tx.send(Ok(notice)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }

                tokio::select! {
                    _ = &mut notified => {}
                    _ = tx.closed() => {
                        debug!(cursor, "memory watch closed");
                        return;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state()?;
        let expired: Vec<(Cursor, EventId)> = state
            .rows
            .iter()
            .filter(|(_, row)| row.event.timestamp < before)
            .map(|(c, row)| (*c, row.event.event_id))
            .collect();
        for (cursor, id) in &expired {
            state.rows.remove(cursor);
            state.by_id.remove(id);
        }
        Ok(expired.len() as u64)
    }
}
