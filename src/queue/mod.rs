//! Task execution on top of the event bus.
//!
//! A task is a `task.queued` event. The queue subscribes to that type,
//! admits deliveries up to `max_concurrent_tasks`, runs the registered
//! handler under a timeout, caches the [`TaskResult`] and publishes
//! `task.completed` or `task.failed`.
//!
//! When no slot frees up within `admission_timeout` the delivery fails with
//! [`Error::QueueFull`]; the bus then retries it with backoff. On the bus's
//! last delivery attempt the refusal becomes the task's result instead, so
//! waiters see a failed task rather than a timeout.

mod handler;

pub use handler::{TaskHandler, TaskRequest};

use chrono::Utc;
use moka::future::Cache;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::bus::{EventBus, SubscriptionId};
use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::model::{
    Event, EventId, EventQuery, EventType, Priority, RetryPolicy, TaskResult, TaskStatus,
};
use crate::telemetry::{metrics, spans};

/// Point-in-time view of one queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub active_tasks: usize,
    pub max_concurrent: usize,
    /// `active_tasks / max_concurrent`.
    pub queue_utilization: f64,
    /// Results currently cached.
    pub completed_tasks: u64,
    pub result_capacity: u64,
    /// Results dropped for capacity or age.
    pub evicted_results: u64,
    /// Registered task types, sorted.
    pub task_handlers: Vec<String>,
}

#[derive(Clone)]
struct RegisteredTask {
    handler: Arc<dyn TaskHandler>,
    policy: RetryPolicy,
}

struct QueueInner {
    bus: EventBus,
    config: QueueConfig,
    handlers: RwLock<HashMap<String, RegisteredTask>>,
    slots: Arc<Semaphore>,
    active: Mutex<HashSet<EventId>>,
    results: Cache<EventId, TaskResult>,
    evicted: Arc<AtomicU64>,
    /// Woken whenever a result is stored or an active task clears.
    finished: Notify,
    running: AtomicBool,
    subscription: Mutex<Option<SubscriptionId>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a task queue. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(bus: EventBus, config: QueueConfig) -> Self {
        let evicted = Arc::new(AtomicU64::new(0));
        let eviction_count = Arc::clone(&evicted);
        let results = Cache::builder()
            .max_capacity(config.result_capacity)
            .time_to_live(config.result_ttl())
            .eviction_listener(move |_id, _result: TaskResult, cause| {
                if cause.was_evicted() {
                    eviction_count.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            inner: Arc::new(QueueInner {
                bus,
                handlers: RwLock::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
                active: Mutex::new(HashSet::new()),
                results,
                evicted,
                finished: Notify::new(),
                running: AtomicBool::new(false),
                subscription: Mutex::new(None),
                monitor: Mutex::new(None),
                config,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Register the handler for `task_type` with the configured retry policy
    /// for that type (no retries unless configured).
    pub fn register_task_handler<F, Fut>(&self, task_type: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let task_type = task_type.into();
        let policy = self.inner.config.retry_policy(&task_type);
        self.register_handler(task_type, Arc::new(handler), policy)
    }

    pub fn register_task_handler_with_policy<F, Fut>(
        &self,
        task_type: impl Into<String>,
        handler: F,
        policy: RetryPolicy,
    ) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register_handler(task_type, Arc::new(handler), policy)
    }

    /// Register a handler object. Fails if `task_type` already has one.
    pub fn register_handler(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
        policy: RetryPolicy,
    ) -> Result<()> {
        let task_type = task_type.into();
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if handlers.contains_key(&task_type) {
            return Err(Error::HandlerAlreadyRegistered(task_type));
        }
        info!(
            task_type = %task_type,
            max_retries = policy.max_retries,
            "registered task handler"
        );
        handlers.insert(task_type, RegisteredTask { handler, policy });
        Ok(())
    }

    /// Remove the handler for `task_type`. Tasks of that type queued
    /// afterwards fail with a missing-handler error.
    pub fn unregister_task_handler(&self, task_type: &str) -> bool {
        let removed = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_type)
            .is_some();
        if removed {
            info!(task_type, "unregistered task handler");
        }
        removed
    }

    fn handler_for(&self, task_type: &str) -> Option<RegisteredTask> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_type)
            .cloned()
    }

    // -----------------------------------------------------------------------
    // Submission and results
    // -----------------------------------------------------------------------

    /// Publish a `task.queued` event. The returned id is the task id.
    pub async fn queue_task(
        &self,
        task_type: impl Into<String>,
        task_data: Value,
        priority: Priority,
        correlation_id: Option<String>,
    ) -> Result<EventId> {
        let mut request = TaskRequest::new(task_type, task_data).priority(priority);
        request.correlation_id = correlation_id;
        self.submit(request).await
    }

    pub async fn submit(&self, request: TaskRequest) -> Result<EventId> {
        let task_type = request.task_type.clone();
        let task_id = self.inner.bus.publish(request.into_event()).await?;
        info!(%task_id, task_type = %task_type, "queued task");
        Ok(task_id)
    }

    /// Wait until the task's result is available on this queue.
    pub async fn wait_for_task(&self, task_id: EventId, timeout: Duration) -> Result<TaskResult> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.inner.finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.inner.results.get(&task_id).await {
                return Ok(result);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Timeout(format!(
                    "task {task_id} did not finish within {timeout:?}"
                )));
            }
        }
    }

    /// Wait until `expected` distinct tasks with `correlation_id` have
    /// finished. Completion is read from the event history, so tasks run by
    /// another process count too; their results are rebuilt from the
    /// `task.completed` / `task.failed` payloads.
    pub async fn wait_for_workflow(
        &self,
        correlation_id: &str,
        expected: usize,
        timeout: Duration,
    ) -> Result<HashMap<EventId, TaskResult>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll = self.inner.config.workflow_poll_interval();

        loop {
            let mut finished = self.finished_tasks(correlation_id, expected).await?;
            if finished.len() >= expected {
                for (task_id, result) in finished.iter_mut() {
                    if let Some(local) = self.inner.results.get(task_id).await {
                        *result = local;
                    }
                }
                info!(correlation_id, expected, "workflow finished");
                return Ok(finished);
            }

            if tokio::time::Instant::now() + poll > deadline {
                return Err(Error::Timeout(format!(
                    "workflow {correlation_id}: {} of {expected} tasks finished within {timeout:?}",
                    finished.len()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn finished_tasks(
        &self,
        correlation_id: &str,
        expected: usize,
    ) -> Result<HashMap<EventId, TaskResult>> {
        let limit = expected.max(100);
        let mut finished = HashMap::new();
        for event_type in [EventType::TaskCompleted, EventType::TaskFailed] {
            let query = EventQuery::new()
                .event_type(event_type)
                .correlation_id(correlation_id)
                .limit(limit);
            for event in self.inner.bus.query_events(&query).await? {
                if let Some(result) = result_from_event(&event) {
                    finished.entry(result.task_id).or_insert(result);
                }
            }
        }
        Ok(finished)
    }

    pub async fn task_status(&self, task_id: EventId) -> TaskStatus {
        if let Some(result) = self.inner.results.get(&task_id).await {
            return if result.success {
                TaskStatus::Completed(result)
            } else {
                TaskStatus::Failed(result)
            };
        }
        if self.is_active(task_id) {
            TaskStatus::Active
        } else {
            TaskStatus::Unknown
        }
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        self.inner.results.run_pending_tasks().await;
        let active_tasks = self.active_count();
        let max_concurrent = self.inner.config.max_concurrent_tasks.max(1);
        let mut task_handlers: Vec<String> = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        task_handlers.sort();

        QueueStats {
            active_tasks,
            max_concurrent,
            queue_utilization: active_tasks as f64 / max_concurrent as f64,
            completed_tasks: self.inner.results.entry_count(),
            result_capacity: self.inner.config.result_capacity,
            evicted_results: self.inner.evicted.load(Ordering::Relaxed),
            task_handlers,
        }
    }

    fn active_count(&self) -> usize {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_active(&self, task_id: EventId) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&task_id)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Begin accepting `task.queued` deliveries and start the monitor.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("task queue already running");
            return;
        }

        {
            let mut subscription = self
                .inner
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if subscription.is_none() {
                let queue = Arc::downgrade(&self.inner);
                let id = self
                    .inner
                    .bus
                    .subscribe(EventType::TaskQueued, move |event: Event| {
                        let queue = queue.clone();
                        async move {
                            let inner = queue
                                .upgrade()
                                .ok_or_else(|| anyhow::anyhow!("task queue dropped"))?;
                            TaskQueue { inner }.admit(event).await?;
                            Ok(())
                        }
                    });
                *subscription = Some(id);
            }
        }

        let monitor = tokio::spawn(monitor_loop(
            Arc::downgrade(&self.inner),
            self.inner.config.monitor_interval(),
        ));
        if let Some(old) = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(monitor)
        {
            old.abort();
        }

        info!(
            max_concurrent = self.inner.config.max_concurrent_tasks,
            "task queue started"
        );
    }

    /// Stop admitting tasks and wait up to the drain timeout for active ones.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(monitor) = self
            .inner
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            monitor.abort();
        }

        let drained = tokio::time::timeout(self.inner.config.drain_timeout(), async {
            loop {
                let notified = self.inner.finished.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                active = self.active_count(),
                "tasks still running after drain timeout"
            );
        }
        info!("task queue stopped");
    }

    // -----------------------------------------------------------------------
    // Admission and execution
    // -----------------------------------------------------------------------

    async fn admit(&self, event: Event) -> Result<()> {
        let task_id = event.event_id;
        let task_type = event.task_type().unwrap_or_default().to_string();

        if !self.is_running() {
            metrics::task_rejections().add(1, &[KeyValue::new("reason", "stopped")]);
            return self.reject(&event, task_type, Error::QueueStopped).await;
        }
        if self.is_active(task_id) || self.inner.results.contains_key(&task_id) {
            debug!(%task_id, "duplicate task delivery ignored");
            return Ok(());
        }

        let permit = match tokio::time::timeout(
            self.inner.config.admission_timeout(),
            Arc::clone(&self.inner.slots).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return self.reject(&event, task_type, Error::QueueStopped).await,
            Err(_) => {
                metrics::task_rejections().add(1, &[KeyValue::new("reason", "full")]);
                warn!(%task_id, task_type = %task_type, "task queue full");
                let full = Error::QueueFull {
                    max_concurrent: self.inner.config.max_concurrent_tasks,
                };
                return self.reject(&event, task_type, full).await;
            }
        };

        let Some(active) = ActiveTask::mark(&self.inner, task_id, &task_type) else {
            debug!(%task_id, "duplicate task delivery ignored");
            return Ok(());
        };

        let task_data = event.data.get("task_data").cloned().unwrap_or(Value::Null);
        let queue = self.clone();
        tokio::spawn(async move {
            queue
                .execute(task_id, task_type, task_data, event.correlation_id, permit, active)
                .await;
        });
        Ok(())
    }

    /// Refuse a delivery with `error`. When the bus will not deliver again
    /// the refusal is recorded as the task's failed result.
    async fn reject(&self, event: &Event, task_type: String, error: Error) -> Result<()> {
        if self.inner.bus.config().delivery.allows_retry(event.retry_count) {
            return Err(error);
        }
        error!(
            task_id = %event.event_id,
            task_type = %task_type,
            error = %error,
            "task refused on final delivery attempt"
        );
        let result = TaskResult {
            task_id: event.event_id,
            task_type,
            success: false,
            result: None,
            error: Some(error.to_string()),
            duration_ms: 0,
            attempts: 0,
            finished_at: Utc::now(),
        };
        self.record_result(result, event.correlation_id.clone()).await;
        Err(error)
    }

    async fn execute(
        &self,
        task_id: EventId,
        task_type: String,
        task_data: Value,
        correlation_id: Option<String>,
        _permit: OwnedSemaphorePermit,
        _active: ActiveTask,
    ) {
        let span = spans::start_task_span(&task_type, &task_id);
        async {
            self.publish_quietly(
                Event::new(
                    EventType::TaskStarted,
                    "task_queue",
                    json!({
                        "task_id": task_id,
                        "task_type": task_type,
                        "started_at": Utc::now(),
                    }),
                )
                .maybe_correlation_id(correlation_id.clone()),
            )
            .await;

            let started = Instant::now();
            let (outcome, attempts) = match self.handler_for(&task_type) {
                Some(registered) => self.run_with_retries(registered, task_data).await,
                None => (
                    Err(format!("No handler registered for task type: {task_type}")),
                    0,
                ),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let result = TaskResult {
                task_id,
                task_type: task_type.clone(),
                success: outcome.is_ok(),
                error: outcome.as_ref().err().cloned(),
                result: outcome.ok(),
                duration_ms,
                attempts,
                finished_at: Utc::now(),
            };
            let outcome_label = if result.success { "completed" } else { "failed" };
            tracing::Span::current().record("task.outcome", outcome_label);
            metrics::operation_duration_ms().record(
                duration_ms as f64,
                &[KeyValue::new("operation", "task.execute")],
            );
            if result.success {
                info!(duration_ms, attempts, "task completed");
            } else {
                error!(error = ?result.error, attempts, "task failed");
            }
            self.record_result(result, correlation_id).await;
        }
        .instrument(span)
        .await
    }

    /// Cache `result`, wake waiters and publish `task.completed` or `task.failed`.
    async fn record_result(&self, result: TaskResult, correlation_id: Option<String>) {
        self.inner.results.insert(result.task_id, result.clone()).await;
        self.inner.finished.notify_waiters();

        let outcome = if result.success { "completed" } else { "failed" };
        metrics::tasks_finished().add(
            1,
            &[
                KeyValue::new("task_type", result.task_type.clone()),
                KeyValue::new("outcome", outcome),
            ],
        );

        let finished = if result.success {
            Event::new(
                EventType::TaskCompleted,
                "task_queue",
                json!({
                    "task_id": result.task_id,
                    "task_type": result.task_type,
                    "result": result.result,
                    "duration_ms": result.duration_ms,
                }),
            )
        } else {
            Event::new(
                EventType::TaskFailed,
                "task_queue",
                json!({
                    "task_id": result.task_id,
                    "task_type": result.task_type,
                    "error": result.error,
                }),
            )
        };
        self.publish_quietly(finished.maybe_correlation_id(correlation_id))
            .await;
    }

    /// Run the handler, retrying as its policy allows. Returns the outcome
    /// and the number of invocations made.
    async fn run_with_retries(
        &self,
        registered: RegisteredTask,
        task_data: Value,
    ) -> (std::result::Result<Value, String>, u32) {
        let policy = registered.policy;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self
                .run_once(Arc::clone(&registered.handler), task_data.clone())
                .await
            {
                Ok(value) => return (Ok(value), attempts),
                Err(e) if policy.allows_retry(attempts - 1) => {
                    let delay = policy.delay_for(attempts - 1);
                    warn!(
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "task attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return (Err(e), attempts),
            }
        }
    }

    async fn run_once(
        &self,
        handler: Arc<dyn TaskHandler>,
        task_data: Value,
    ) -> std::result::Result<Value, String> {
        let timeout = self.inner.config.task_timeout();
        let join = tokio::spawn(async move { handler.run(task_data).await });
        let abort = join.abort_handle();

        match tokio::time::timeout(timeout, join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(format!("Task execution error: {e:#}")),
            Ok(Err(e)) if e.is_panic() => Err("Task execution error: handler panicked".to_string()),
            Ok(Err(e)) => Err(format!("Task execution error: {e}")),
            Err(_) => {
                abort.abort();
                Err(format!("Task timeout after {}s", timeout.as_secs_f64()))
            }
        }
    }

    async fn publish_quietly(&self, event: Event) {
        let event_type = event.event_type;
        if let Err(e) = self.inner.bus.publish(event).await {
            warn!(%event_type, error = %e, "cannot publish task lifecycle event");
        }
    }
}

/// Rebuild a result from a `task.completed` or `task.failed` payload.
fn result_from_event(event: &Event) -> Option<TaskResult> {
    let data = &event.data;
    let task_id = data.get("task_id")?.as_str()?.parse::<EventId>().ok()?;
    let task_type = data
        .get("task_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let success = event.event_type == EventType::TaskCompleted;
    Some(TaskResult {
        task_id,
        task_type,
        success,
        result: success.then(|| data.get("result").cloned().unwrap_or(Value::Null)),
        error: data.get("error").and_then(Value::as_str).map(str::to_string),
        duration_ms: data.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        attempts: 0,
        finished_at: event.timestamp,
    })
}

/// Marks a task active for as long as it is held.
struct ActiveTask {
    inner: Arc<QueueInner>,
    task_id: EventId,
    task_type: String,
}

impl ActiveTask {
    /// None if the task is already active.
    fn mark(inner: &Arc<QueueInner>, task_id: EventId, task_type: &str) -> Option<Self> {
        let inserted = inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
        if !inserted {
            return None;
        }
        metrics::active_tasks().add(1, &[KeyValue::new("task_type", task_type.to_string())]);
        Some(Self {
            inner: Arc::clone(inner),
            task_id,
            task_type: task_type.to_string(),
        })
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
        metrics::active_tasks().add(-1, &[KeyValue::new("task_type", self.task_type.clone())]);
        self.inner.finished.notify_waiters();
    }
}

async fn monitor_loop(queue: Weak<QueueInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let Some(inner) = queue.upgrade() else {
            return;
        };
        let stats = TaskQueue { inner }.get_queue_stats().await;
        debug!(
            active = stats.active_tasks,
            max_concurrent = stats.max_concurrent,
            utilization = stats.queue_utilization,
            cached_results = stats.completed_tasks,
            "task queue occupancy"
        );
    }
}
