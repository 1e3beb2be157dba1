//! Durable publish/subscribe event bus.
//!
//! Every event is written to the [`EventStore`] before anything else
//! happens. Two paths then dispatch it to subscribers:
//!
//! - the live path tails the store's change stream and dispatches inserts
//!   as they arrive;
//! - the sweep periodically picks up `pending` events the live path missed,
//!   `retrying` events whose backoff has elapsed, and stale `processing`
//!   claims left behind by a crashed dispatcher.
//!
//! Both paths claim an event with a conditional status update before
//! running handlers, so an event is never dispatched by two paths at once.
//! The live path dispatches one event at a time, in insertion order; sweep
//! dispatches run concurrently up to `max_inflight_dispatches`.

pub mod handler;

pub use handler::{EventHandler, SubscriptionId};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::BusConfig;
use crate::error::Result;
use crate::model::{Event, EventId, EventQuery, EventStatus, EventType};
use crate::store::{Cursor, EventStore, StatusChange, time_after, time_before};
use crate::telemetry::{metrics, spans};
use handler::HandlerRegistry;

/// Event counts by type, then status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EventStats(pub BTreeMap<EventType, BTreeMap<EventStatus, u64>>);

impl EventStats {
    pub fn count(&self, event_type: EventType, status: EventStatus) -> u64 {
        self.0
            .get(&event_type)
            .and_then(|by_status| by_status.get(&status))
            .copied()
            .unwrap_or(0)
    }

    /// Events of any type with `status`.
    pub fn with_status(&self, status: EventStatus) -> u64 {
        self.0
            .values()
            .filter_map(|by_status| by_status.get(&status))
            .sum()
    }

    pub fn total(&self) -> u64 {
        self.0.values().flat_map(|by_status| by_status.values()).sum()
    }
}

#[derive(Debug, Clone, Copy)]
enum DispatchPath {
    Live,
    Sweep,
}

impl DispatchPath {
    fn as_str(self) -> &'static str {
        match self {
            DispatchPath::Live => "live",
            DispatchPath::Sweep => "sweep",
        }
    }
}

struct BusInner {
    store: Arc<dyn EventStore>,
    config: BusConfig,
    handlers: RwLock<HandlerRegistry>,
    running: AtomicBool,
    /// Last change-stream position seen, so a restarted stream does not
    /// replay what the live path already handled.
    resume_cursor: Mutex<Option<Cursor>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    dispatch_slots: Arc<Semaphore>,
    completed: broadcast::Sender<Event>,
}

/// Handle to an event bus. Cheap to clone; clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(store: Arc<dyn EventStore>, config: BusConfig) -> Self {
        let (shutdown, _) = watch::channel(true);
        let (completed, _) = broadcast::channel(config.stream_capacity.max(1));
        let slots = config.max_inflight_dispatches.max(1);
        Self {
            inner: Arc::new(BusInner {
                store,
                handlers: RwLock::new(HandlerRegistry::default()),
                running: AtomicBool::new(false),
                resume_cursor: Mutex::new(None),
                loops: Mutex::new(Vec::new()),
                shutdown,
                dispatch_slots: Arc::new(Semaphore::new(slots)),
                completed,
                config,
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.inner.store
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Prepare the store (indices, retention). Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        self.inner.store.prepare(self.inner.config.retention()).await?;
        info!(
            retention_days = self.inner.config.retention_days,
            "event bus initialized"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    /// Register a handler for one event type. Handlers run for every event
    /// of that type dispatched after this call returns.
    pub fn subscribe<F, Fut>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(Some(event_type), Arc::new(handler))
    }

    /// Register a handler for every event type.
    pub fn subscribe_all<F, Fut>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_handler(None, Arc::new(handler))
    }

    /// Register a handler object, for one type or (with `None`) for all.
    pub fn subscribe_handler(
        &self,
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = self.registry_mut().add(event_type, handler);
        match event_type {
            Some(event_type) => info!(%event_type, subscription = %id, "subscribed handler"),
            None => info!(subscription = %id, "subscribed global handler"),
        }
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.registry_mut().remove(id);
        if removed {
            info!(subscription = %id, "unsubscribed handler");
        }
        removed
    }

    pub fn handler_count(&self) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn registry_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerRegistry> {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_for(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers_for(event_type)
    }

    // -----------------------------------------------------------------------
    // Publishing and queries
    // -----------------------------------------------------------------------

    /// Persist `event` as `pending` and return its id.
    ///
    /// Dispatch happens asynchronously; an `Ok` only means the event is
    /// durably stored.
    pub async fn publish(&self, mut event: Event) -> Result<EventId> {
        event.status = EventStatus::Pending;
        event.retry_count = 0;
        event.error = None;
        event.retry_at = None;
        event.processed_at = None;

        let labels = |result: &'static str| {
            [
                KeyValue::new("event_type", event.event_type.as_str()),
                KeyValue::new("result", result),
            ]
        };
        match self.inner.store.insert(&event).await {
            Ok(cursor) => {
                metrics::events_published().add(1, &labels("ok"));
                debug!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    cursor,
                    "published event"
                );
                Ok(event.event_id)
            }
            Err(e) => {
                metrics::events_published().add(1, &labels("error"));
                error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "failed to publish event"
                );
                Err(e)
            }
        }
    }

    /// Historical events matching `query`, newest first.
    pub async fn query_events(&self, query: &EventQuery) -> Result<Vec<Event>> {
        self.inner.store.find(query).await
    }

    /// The `limit` most recent events.
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<Event>> {
        self.query_events(&EventQuery::new().limit(limit)).await
    }

    pub async fn get_event(&self, id: EventId) -> Result<Option<Event>> {
        self.inner.store.get(id).await
    }

    pub async fn get_event_stats(&self) -> Result<EventStats> {
        let mut stats = EventStats::default();
        for row in self.inner.store.status_counts().await? {
            *stats
                .0
                .entry(row.event_type)
                .or_default()
                .entry(row.status)
                .or_default() += row.count;
        }
        Ok(stats)
    }

    /// Receive every event as it completes dispatch. Slow receivers miss
    /// events once the buffer fills.
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.inner.completed.subscribe()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start the live and sweep loops. Starting a running bus is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("event bus already running");
            return;
        }
        self.inner.shutdown.send_replace(false);

        let live = tokio::spawn(self.clone().live_loop());
        let sweep = tokio::spawn(self.clone().sweep_loop());
        self.inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([live, sweep]);

        info!(
            sweep_interval_ms = self.inner.config.sweep_interval_ms,
            max_inflight = self.inner.config.max_inflight_dispatches,
            "event bus started"
        );
    }

    /// Cancel both loops and wait, up to the stop timeout, for in-flight
    /// dispatches. Stopping a stopped bus is a no-op.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let loops: Vec<_> = self
            .inner
            .loops
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in &loops {
            handle.abort();
        }
        for handle in loops {
            let _ = handle.await;
        }

        let slots = self.inner.config.max_inflight_dispatches.max(1) as u32;
        match tokio::time::timeout(
            self.inner.config.stop_timeout(),
            self.inner.dispatch_slots.acquire_many(slots),
        )
        .await
        {
            Ok(Ok(permits)) => drop(permits),
            Ok(Err(_)) => {}
            Err(_) => warn!(
                in_flight = slots as usize - self.inner.dispatch_slots.available_permits(),
                "dispatches still running after stop timeout"
            ),
        }
        info!("event bus stopped");
    }

    fn resume_cursor(&self) -> Option<Cursor> {
        *self
            .inner
            .resume_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_resume_cursor(&self, cursor: Cursor) {
        *self
            .inner
            .resume_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(cursor);
    }

    async fn live_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let delay = self.inner.config.reconnect_delay();

        loop {
            let resume = self.resume_cursor();
            let mut changes = match self.inner.store.watch(resume).await {
                Ok(changes) => changes,
                Err(e) => {
                    error!(error = %e, "cannot open change stream");
                    if wait_or_shutdown(&mut shutdown, delay).await {
                        return;
                    }
                    continue;
                }
            };
            debug!(resume_after = ?resume, "change stream open");

            loop {
                let notice = tokio::select! {
                    _ = shutdown.changed() => return,
                    notice = changes.recv() => notice,
                };
                match notice {
                    Some(Ok(notice)) => {
                        self.set_resume_cursor(notice.cursor);
                        if notice.event.status.is_terminal() {
                            continue;
                        }
                        // Wait for the dispatch to finish before taking the next notice.
                        if let Some(dispatch) =
                            self.spawn_dispatch(notice.event, DispatchPath::Live).await
                        {
                            let _ = dispatch.await;
                        }
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "change stream failed");
                        break;
                    }
                    None => {
                        warn!("change stream ended");
                        break;
                    }
                }
            }

            if wait_or_shutdown(&mut shutdown, delay).await {
                return;
            }
            info!("reopening change stream");
        }
    }

    async fn sweep_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let interval = self.inner.config.sweep_interval();
        let mut last_purge: Option<Instant> = None;

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "sweep failed");
            }

            let purge_due =
                last_purge.is_none_or(|t| t.elapsed() >= self.inner.config.purge_interval());
            if self.inner.config.retention_days > 0 && purge_due {
                self.purge_expired().await;
                last_purge = Some(Instant::now());
            }

            if wait_or_shutdown(&mut shutdown, interval).await {
                return;
            }
        }
    }

    async fn sweep_once(&self) -> Result<usize> {
        let config = &self.inner.config;
        let events = self
            .inner
            .store
            .find_dispatchable(
                Utc::now(),
                config.pending_grace(),
                config.stale_after(),
                config.sweep_batch,
            )
            .await?;
        let found = events.len();
        for event in events {
            debug!(
                event_id = %event.event_id,
                status = %event.status,
                retry_count = event.retry_count,
                "sweep picked up event"
            );
            // Detached: sweep dispatches overlap.
            let _ = self.spawn_dispatch(event, DispatchPath::Sweep).await;
        }
        Ok(found)
    }

    async fn purge_expired(&self) {
        let before = time_before(Utc::now(), self.inner.config.retention());
        match self.inner.store.purge_expired(before).await {
            Ok(0) => {}
            Ok(purged) => {
                metrics::events_purged().add(purged, &[]);
                info!(purged, %before, "purged expired events");
            }
            Err(e) => error!(error = %e, "retention purge failed"),
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Wait for a dispatch slot, then claim and dispatch `event` on its own
    /// task. The task outlives a cancelled caller, so `stop` can drain it.
    async fn spawn_dispatch(&self, event: Event, path: DispatchPath) -> Option<JoinHandle<()>> {
        let permit = Arc::clone(&self.inner.dispatch_slots)
            .acquire_owned()
            .await
            .ok()?;
        let bus = self.clone();
        Some(tokio::spawn(async move {
            let _permit = permit;
            bus.claim_and_dispatch(event.event_id, path).await;
        }))
    }

    async fn claim_and_dispatch(&self, id: EventId, path: DispatchPath) {
        let store = &self.inner.store;
        let config = &self.inner.config;
        match store
            .claim(
                id,
                Utc::now(),
                config.stale_after(),
                config.delivery.max_retries,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metrics::claim_conflicts().add(1, &[KeyValue::new("path", path.as_str())]);
                debug!(event_id = %id, path = path.as_str(), "event not claimable, skipping");
                return;
            }
            Err(e) => {
                error!(event_id = %id, error = %e, "claim failed");
                return;
            }
        }

        // Re-read after the claim so retry_count reflects the latest attempt.
        let event = match store.get(id).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                warn!(event_id = %id, "claimed event disappeared");
                return;
            }
            Err(e) => {
                error!(event_id = %id, error = %e, "cannot load claimed event");
                return;
            }
        };

        let span = spans::start_dispatch_span(event.event_type, &event.event_id, path.as_str());
        self.dispatch(event, span.clone()).instrument(span).await;
    }

    async fn dispatch(&self, event: Event, span: tracing::Span) {
        let started = Instant::now();
        let handlers = self.handlers_for(event.event_type);

        let failure = if handlers.is_empty() {
            debug!("no handlers registered");
            None
        } else {
            let running: Vec<_> = handlers
                .into_iter()
                .map(|handler| {
                    let event = event.clone();
                    tokio::spawn(async move { handler.handle(event).await })
                })
                .collect();
            let aborts: Vec<_> = running.iter().map(JoinHandle::abort_handle).collect();

            // Bounded below stale_after, so the sweep never takes over a
            // claim whose handlers are still running.
            let limit = self.inner.config.dispatch_timeout();
            match tokio::time::timeout(limit, first_failure(running)).await {
                Ok(first_error) => first_error,
                Err(_) => {
                    for handle in &aborts {
                        handle.abort();
                    }
                    let error = format!("dispatch timed out after {:.1}s", limit.as_secs_f64());
                    error!(error = %error, handlers = aborts.len(), "handlers aborted");
                    Some(error)
                }
            }
        };

        let change = match failure {
            None => StatusChange::Completed,
            Some(error) => self.failure_change(&event, error),
        };
        let to = change.status();
        spans::record_state_transition(&span, EventStatus::Processing.as_str(), to.as_str());

        match self.inner.store.transition(event.event_id, change).await {
            Ok(true) => {}
            Ok(false) => warn!("event no longer processing, status write skipped"),
            Err(e) => error!(error = %e, "cannot record dispatch outcome"),
        }

        metrics::event_dispatches().add(
            1,
            &[
                KeyValue::new("event_type", event.event_type.as_str()),
                KeyValue::new("outcome", to.as_str()),
            ],
        );
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "event.dispatch")],
        );

        if to == EventStatus::Completed {
            let mut done = event;
            done.status = EventStatus::Completed;
            done.processed_at = Some(Utc::now());
            // No receivers is fine.
            let _ = self.inner.completed.send(done);
        }
    }

    fn failure_change(&self, event: &Event, error: String) -> StatusChange {
        let policy = self.inner.config.delivery;
        if policy.allows_retry(event.retry_count) {
            let delay = policy.delay_for(event.retry_count);
            warn!(
                retry_count = event.retry_count + 1,
                delay_ms = delay.as_millis() as u64,
                "event will be retried"
            );
            StatusChange::Retrying {
                retry_count: event.retry_count + 1,
                error,
                retry_at: time_after(Utc::now(), delay),
            }
        } else {
            error!(retry_count = event.retry_count, error = %error, "event failed permanently");
            StatusChange::Failed { error }
        }
    }
}

/// Await every handler. The first failure in registration order wins.
async fn first_failure(running: Vec<JoinHandle<anyhow::Result<()>>>) -> Option<String> {
    let mut first_error = None;
    let mut failures = 0usize;
    for join in running {
        let error = match join.await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{e:#}"),
            Err(e) if e.is_panic() => "handler panicked".to_string(),
            Err(e) => e.to_string(),
        };
        failures += 1;
        warn!(error = %error, "handler failed");
        first_error.get_or_insert(error);
    }
    if failures > 0 {
        error!(failures, "event dispatch had handler failures");
    }
    first_error
}

/// Sleep for `delay` unless shutdown is signalled first. Returns true on shutdown.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
