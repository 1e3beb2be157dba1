//! Postgres event store via direct SQLx.
//!
//! Inserts fire `pg_notify('event_inserted', seq)` inside the insert
//! transaction, so a notification is only seen once the row is visible.
//! Watchers tail by `seq` and fall back to polling when NOTIFY is silent.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    ChangeNotice, ChangeStream, Cursor, EventStore, STALE_CLAIM_ERROR, StatusChange, StatusCount,
    time_before,
};
use crate::error::{Error, Result};
use crate::model::{Event, EventId, EventQuery, EventStatus, Priority};

const NOTIFY_CHANNEL: &str = "event_inserted";
const CATCH_UP_BATCH: i64 = 100;
const WATCH_BUFFER: usize = 256;

const EVENT_COLUMNS: &str = "seq, event_id, event_type, source, data, timestamp, correlation_id, \
     priority, status, retry_count, error, metadata, retry_at, processed_at";

/// Event store backed by the `events` table.
pub struct PgEventStore {
    pool: PgPool,
    poll_interval: Duration,
    retention: Mutex<Option<Duration>>,
}

impl PgEventStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_secs(5),
            retention: Mutex::new(None),
        }
    }

    /// Poll interval used by watchers when no NOTIFY arrives.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention.lock().map(|r| *r).unwrap_or(None)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn prepare(&self, retention: Duration) -> Result<()> {
        self.migrate().await?;
        if let Ok(mut r) = self.retention.lock() {
            *r = Some(retention);
        }
        info!(retention_secs = retention.as_secs(), "event table ready");
        Ok(())
    }

    async fn insert(&self, event: &Event) -> Result<Cursor> {
        let mut tx = self.pool.begin().await?;

        let (seq,): (i64,) = sqlx::query_as(
            "INSERT INTO events (event_id, event_type, source, data, timestamp, correlation_id,
                                 priority, status, retry_count, error, metadata, retry_at, processed_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, now())
             RETURNING seq",
        )
        .bind(event.event_id.0)
        .bind(event.event_type.as_str())
        .bind(&event.source)
        .bind(&event.data)
        .bind(event.timestamp)
        .bind(&event.correlation_id)
        .bind(event.priority.rank())
        .bind(event.status.to_string())
        .bind(event.retry_count as i32)
        .bind(&event.error)
        .bind(&event.metadata)
        .bind(event.retry_at)
        .bind(event.processed_at)
        .fetch_one(&mut *tx)
        .await?;

        // NOTIFY is transactional, only fires on commit
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(seq.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(seq)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>> {
        let row: Option<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE event_id = $1"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EventRow::try_into_event).transpose()
    }

    async fn find(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE ($1::text IS NULL OR event_type = $1)
             AND ($2::text IS NULL OR correlation_id = $2)
             AND ($3::text IS NULL OR status = $3)
             AND ($4::timestamptz IS NULL OR timestamp >= $4)
             AND ($5::timestamptz IS NULL OR timestamp <= $5)
             ORDER BY timestamp DESC
             LIMIT $6"
        ))
        .bind(query.event_type.map(|t| t.as_str()))
        .bind(&query.correlation_id)
        .bind(query.status.map(|s| s.to_string()))
        .bind(query.start_time)
        .bind(query.end_time)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        pending_grace: Duration,
        stale_after: Duration,
        limit: usize,
    ) -> Result<Vec<Event>> {
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "SELECT {EVENT_COLUMNS} FROM events
             WHERE (status = 'pending' AND timestamp <= $1)
             OR (status = 'retrying' AND (retry_at IS NULL OR retry_at <= $2))
             OR (status = 'processing' AND updated_at <= $3)
             ORDER BY priority DESC, timestamp ASC
             LIMIT $4"
        ))
        .bind(time_before(now, pending_grace))
        .bind(now)
        .bind(time_before(now, stale_after))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EventRow::try_into_event).collect()
    }

    async fn claim(
        &self,
        id: EventId,
        now: DateTime<Utc>,
        stale_after: Duration,
        max_retries: u32,
    ) -> Result<bool> {
        // SET expressions see the row as it was before the update.
        let status: Option<String> = sqlx::query_scalar(
            "UPDATE events SET
                status = CASE WHEN status = 'processing' AND retry_count >= $4
                              THEN 'failed' ELSE 'processing' END,
                retry_count = CASE WHEN status = 'processing' AND retry_count < $4
                                   THEN retry_count + 1 ELSE retry_count END,
                error = CASE WHEN status = 'processing' THEN $5 ELSE error END,
                processed_at = CASE WHEN status = 'processing' AND retry_count >= $4
                                    THEN $2 ELSE processed_at END,
                updated_at = $2
             WHERE event_id = $1
             AND (status = 'pending'
                  OR (status = 'retrying' AND (retry_at IS NULL OR retry_at <= $2))
                  OR (status = 'processing' AND updated_at <= $3))
             RETURNING status",
        )
        .bind(id.0)
        .bind(now)
        .bind(time_before(now, stale_after))
        .bind(i32::try_from(max_retries).unwrap_or(i32::MAX))
        .bind(STALE_CLAIM_ERROR)
        .fetch_optional(&self.pool)
        .await?;

        if status.as_deref() == Some("failed") {
            warn!(event_id = %id, "stale claim abandoned, event failed");
        }
        Ok(status.as_deref() == Some("processing"))
    }

    async fn transition(&self, id: EventId, change: StatusChange) -> Result<bool> {
        let now = Utc::now();
        let query = match &change {
            StatusChange::Completed => sqlx::query(
                "UPDATE events SET status = 'completed', processed_at = $2, updated_at = $2
                 WHERE event_id = $1 AND status = 'processing'",
            )
            .bind(id.0)
            .bind(now),
            StatusChange::Retrying {
                retry_count,
                error,
                retry_at,
            } => sqlx::query(
                "UPDATE events SET status = 'retrying', retry_count = $3, error = $4, retry_at = $5,
                        updated_at = $2
                 WHERE event_id = $1 AND status = 'processing'",
            )
            .bind(id.0)
            .bind(now)
            .bind(*retry_count as i32)
            .bind(error.clone())
            .bind(*retry_at),
            StatusChange::Failed { error } => sqlx::query(
                "UPDATE events SET status = 'failed', error = $3, processed_at = $2, updated_at = $2
                 WHERE event_id = $1 AND status = 'processing'",
            )
            .bind(id.0)
            .bind(now)
            .bind(error.clone()),
        };

        let rows_affected = query.execute(&self.pool).await?.rows_affected();
        Ok(rows_affected == 1)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT event_type, status, COUNT(*) FROM events GROUP BY event_type, status",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(event_type, status, count)| {
                Ok(StatusCount {
                    event_type: event_type.parse()?,
                    status: status.parse()?,
                    count: count as u64,
                })
            })
            .collect()
    }

    async fn watch(&self, resume_after: Option<Cursor>) -> Result<ChangeStream> {
        let mut cursor = match resume_after {
            Some(c) => c,
            None => {
                let (max,): (i64,) = sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM events")
                    .fetch_one(&self.pool)
                    .await?;
                max
            }
        };

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;

        let pool = self.pool.clone();
        let poll_interval = self.poll_interval;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            loop {
                // Catch up on everything past the cursor.
                loop {
                    let rows = match fetch_after(&pool, cursor).await {
                        Ok(rows) => rows,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    if rows.is_empty() {
                        break;
                    }
                    for row in rows {
                        let seq = row.seq;
                        let notice = row
                            .try_into_event()
                            .map(|event| ChangeNotice { cursor: seq, event });
                        cursor = seq;
                        if tx.send(notice).await.is_err() {
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = tx.closed() => {
                        debug!(cursor, "postgres watch closed");
                        return;
                    }
                    notif = listener.recv() => {
                        if let Err(e) = notif {
                            warn!("PgListener error: {e}, falling back to poll");
                            tokio::time::sleep(poll_interval).await;
                        }
                    }
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        });

        Ok(rx)
    }

    async fn purge_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let rows_affected = sqlx::query("DELETE FROM events WHERE timestamp < $1")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(rows_affected)
    }
}

async fn fetch_after(pool: &PgPool, cursor: Cursor) -> Result<Vec<EventRow>> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE seq > $1 ORDER BY seq ASC LIMIT $2"
    ))
    .bind(cursor)
    .bind(CATCH_UP_BATCH)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct EventRow {
    seq: i64,
    event_id: Uuid,
    event_type: String,
    source: String,
    data: Value,
    timestamp: DateTime<Utc>,
    correlation_id: Option<String>,
    priority: i16,
    status: String,
    retry_count: i32,
    error: Option<String>,
    metadata: Value,
    retry_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
}

impl EventRow {
    fn try_into_event(self) -> Result<Event> {
        Ok(Event {
            event_id: EventId(self.event_id),
            event_type: self.event_type.parse()?,
            source: self.source,
            data: self.data,
            timestamp: self.timestamp,
            correlation_id: self.correlation_id,
            priority: Priority::from_rank(self.priority)?,
            status: self.status.parse::<EventStatus>()?,
            retry_count: u32::try_from(self.retry_count)
                .map_err(|_| Error::Other(format!("negative retry_count for {}", self.event_id)))?,
            error: self.error,
            metadata: self.metadata,
            retry_at: self.retry_at,
            processed_at: self.processed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pg_event_store_implements_event_store() {
        fn _assert_impl<T: EventStore>() {}
        _assert_impl::<PgEventStore>();
    }
}
