//! Integration tests for the task queue.

use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use gateway_events::bus::EventBus;
use gateway_events::config::{BusConfig, QueueConfig};
use gateway_events::error::Error;
use gateway_events::model::*;
use gateway_events::queue::{TaskQueue, TaskRequest};
use gateway_events::store::MemoryEventStore;

const WAIT: Duration = Duration::from_secs(5);

fn bus_config() -> BusConfig {
    BusConfig {
        sweep_interval_ms: 20,
        pending_grace_ms: 50,
        reconnect_delay_ms: 20,
        stop_timeout_ms: 1_000,
        delivery: RetryPolicy::new(3, Duration::from_millis(20)),
        ..BusConfig::default()
    }
}

fn queue_config() -> QueueConfig {
    QueueConfig {
        admission_timeout_ms: 500,
        monitor_interval_ms: 50,
        workflow_poll_interval_ms: 20,
        ..QueueConfig::default()
    }
}

async fn setup(bus_config: BusConfig, queue_config: QueueConfig) -> (EventBus, TaskQueue) {
    let store = MemoryEventStore::new();
    let bus = EventBus::new(Arc::new(store), bus_config);
    bus.initialize().await.unwrap();
    bus.start();
    let queue = TaskQueue::new(bus.clone(), queue_config);
    queue.start();
    (bus, queue)
}

async fn wait_for_status(bus: &EventBus, id: EventId, status: EventStatus) -> Event {
    for _ in 0..300 {
        if let Some(event) = bus.get_event(id).await.unwrap() {
            if event.status == status {
                return event;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("event {id} never reached {status}");
}

async fn events_of(bus: &EventBus, event_type: EventType, correlation_id: &str) -> Vec<Event> {
    bus.query_events(
        &EventQuery::new()
            .event_type(event_type)
            .correlation_id(correlation_id),
    )
    .await
    .unwrap()
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_task_runs_and_announces_lifecycle() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    queue
        .register_task_handler("echo", |data: Value| async move { Ok(json!({"echo": data})) })
        .unwrap();

    let task_id = queue
        .queue_task("echo", json!({"msg": "hi"}), Priority::High, Some("c-1".into()))
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(result.success);
    assert_eq!(result.task_id, task_id);
    assert_eq!(result.task_type, "echo");
    assert_eq!(result.result, Some(json!({"echo": {"msg": "hi"}})));
    assert_eq!(result.attempts, 1);
    assert!(result.error.is_none());

    let queued = bus.get_event(task_id).await.unwrap().unwrap();
    assert_eq!(queued.event_type, EventType::TaskQueued);
    assert_eq!(queued.priority, Priority::High);
    assert_eq!(queued.task_type(), Some("echo"));

    let started = events_of(&bus, EventType::TaskStarted, "c-1").await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].data["task_id"], json!(task_id.to_string()));
    assert!(started[0].data.get("started_at").is_some());

    let mut completed = Vec::new();
    for _ in 0..100 {
        completed = events_of(&bus, EventType::TaskCompleted, "c-1").await;
        if !completed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].data["task_type"], "echo");
    assert_eq!(completed[0].data["result"], json!({"echo": {"msg": "hi"}}));
    assert!(completed[0].data["duration_ms"].is_u64());

    wait_for_status(&bus, task_id, EventStatus::Completed).await;
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn handler_error_becomes_failed_result_without_redelivery() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    queue
        .register_task_handler("explode", move |_data: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("boom") }
        })
        .unwrap();

    let task_id = queue
        .submit(TaskRequest::new("explode", json!({})).correlation_id("c-2"))
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Task execution error: boom"));
    assert!(result.result.is_none());

    // The delivery itself succeeded, so the task is not redelivered.
    let queued = wait_for_status(&bus, task_id, EventStatus::Completed).await;
    assert_eq!(queued.retry_count, 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let failed = events_of(&bus, EventType::TaskFailed, "c-2").await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].data["error"], "Task execution error: boom");
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn missing_handler_fails_immediately() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;

    let task_id = queue
        .queue_task("nope", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(!result.success);
    assert_eq!(
        result.error.as_deref(),
        Some("No handler registered for task type: nope")
    );
    assert_eq!(result.attempts, 0);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn slow_handler_times_out() {
    let config = QueueConfig {
        task_timeout_ms: 50,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config(), config).await;
    queue
        .register_task_handler("slow", |_data: Value| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let task_id = queue
        .queue_task("slow", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Task timeout after 0.05s"));
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn task_retry_policy_reruns_the_handler() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    queue
        .register_task_handler_with_policy(
            "flaky",
            move |_data: Value| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        anyhow::bail!("attempt {attempt} failed");
                    }
                    Ok(json!("ok"))
                }
            },
            RetryPolicy::new(2, Duration::from_millis(10)),
        )
        .unwrap();

    let task_id = queue
        .queue_task("flaky", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(result.success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.result, Some(json!("ok")));
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn configured_retry_policy_applies_to_registered_type() {
    let mut config = queue_config();
    config
        .retry
        .insert("flaky".to_string(), RetryPolicy::new(1, Duration::from_millis(10)));
    let (bus, queue) = setup(bus_config(), config).await;
    queue
        .register_task_handler("flaky", |_data: Value| async { anyhow::bail!("always") })
        .unwrap();

    let task_id = queue
        .queue_task("flaky", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.attempts, 2);
    queue.stop().await;
    bus.stop().await;
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_registration_is_rejected() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    queue
        .register_task_handler("echo", |data: Value| async move { Ok(data) })
        .unwrap();

    let err = queue
        .register_task_handler("echo", |data: Value| async move { Ok(data) })
        .unwrap_err();
    assert!(matches!(err, Error::HandlerAlreadyRegistered(t) if t == "echo"));

    assert!(queue.unregister_task_handler("echo"));
    assert!(!queue.unregister_task_handler("echo"));
    queue
        .register_task_handler("echo", |data: Value| async move { Ok(data) })
        .unwrap();
    queue.stop().await;
    bus.stop().await;
}

// ---------------------------------------------------------------------------
// Admission control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrency_never_exceeds_the_limit() {
    let config = QueueConfig {
        max_concurrent_tasks: 2,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config(), config).await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    queue
        .register_task_handler("work", move |_data: Value| {
            let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        })
        .unwrap();

    for _ in 0..6 {
        queue
            .queue_task("work", json!({}), Priority::Medium, Some("burst".into()))
            .await
            .unwrap();
    }
    let results = queue.wait_for_workflow("burst", 6, WAIT).await.unwrap();

    assert_eq!(results.len(), 6);
    assert!(results.values().all(|r| r.success));
    assert!(peak.load(Ordering::SeqCst) <= 2);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn full_queue_pushes_back_and_delivery_is_retried() {
    let bus_config = BusConfig {
        delivery: RetryPolicy::new(3, Duration::from_millis(100)),
        ..bus_config()
    };
    let queue_config = QueueConfig {
        max_concurrent_tasks: 1,
        admission_timeout_ms: 30,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config, queue_config).await;
    queue
        .register_task_handler("hold", |_data: Value| async {
            tokio::time::sleep(Duration::from_millis(150)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let a = queue
        .queue_task("hold", json!({}), Priority::Medium, Some("full".into()))
        .await
        .unwrap();
    let b = queue
        .queue_task("hold", json!({}), Priority::Medium, Some("full".into()))
        .await
        .unwrap();

    let results = queue.wait_for_workflow("full", 2, WAIT).await.unwrap();
    assert!(results.values().all(|r| r.success));

    let a = wait_for_status(&bus, a, EventStatus::Completed).await;
    let b = wait_for_status(&bus, b, EventStatus::Completed).await;
    assert!(a.retry_count + b.retry_count >= 1);
    let error = a.error.or(b.error).unwrap();
    assert!(error.contains("capacity"), "unexpected error: {error}");
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn refusal_on_the_last_delivery_attempt_fails_the_task() {
    let bus_config = BusConfig {
        delivery: RetryPolicy::new(2, Duration::from_millis(20)),
        ..bus_config()
    };
    let queue_config = QueueConfig {
        max_concurrent_tasks: 1,
        admission_timeout_ms: 30,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config, queue_config).await;
    queue
        .register_task_handler("hold", |_data: Value| async {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            Ok(Value::Null)
        })
        .unwrap();

    let a = queue
        .queue_task("hold", json!({}), Priority::Medium, Some("crowded".into()))
        .await
        .unwrap();
    let b = queue
        .queue_task("hold", json!({}), Priority::Medium, Some("crowded".into()))
        .await
        .unwrap();

    let refused = wait_for_status(&bus, b, EventStatus::Failed).await;
    assert_eq!(refused.retry_count, 2);
    match queue.task_status(b).await {
        TaskStatus::Failed(result) => {
            let error = result.error.unwrap_or_default();
            assert!(error.contains("capacity"), "unexpected error: {error}");
            assert_eq!(result.attempts, 0);
        }
        other => panic!("expected a failed task, got {other:?}"),
    }

    let results = queue.wait_for_workflow("crowded", 2, WAIT).await.unwrap();
    assert!(results[&a].success);
    assert!(!results[&b].success);
    assert_eq!(events_of(&bus, EventType::TaskFailed, "crowded").await.len(), 1);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn stopped_queue_refuses_delivery_until_restarted() {
    let bus_config = BusConfig {
        delivery: RetryPolicy::new(3, Duration::from_millis(200)),
        ..bus_config()
    };
    let (bus, queue) = setup(bus_config, queue_config()).await;
    queue
        .register_task_handler("echo", |data: Value| async move { Ok(data) })
        .unwrap();
    queue.stop().await;
    assert!(!queue.is_running());

    let task_id = queue
        .queue_task("echo", json!(1), Priority::Medium, None)
        .await
        .unwrap();
    let event = wait_for_status(&bus, task_id, EventStatus::Retrying).await;
    assert_eq!(event.error.as_deref(), Some("task queue is not running"));

    queue.start();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();
    assert!(result.success);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn failing_task_type_does_not_hold_up_other_types() {
    let config = QueueConfig {
        max_concurrent_tasks: 4,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config(), config).await;
    queue
        .register_task_handler("boom", |_data: Value| async {
            Err::<Value, _>(anyhow::anyhow!("boom"))
        })
        .unwrap();
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    queue
        .register_task_handler("steady", move |_data: Value| {
            let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!("ok"))
            }
        })
        .unwrap();

    for task_type in ["boom", "steady", "boom", "steady", "steady"] {
        queue
            .queue_task(task_type, json!({}), Priority::Medium, Some("mixed".into()))
            .await
            .unwrap();
    }
    let results = queue.wait_for_workflow("mixed", 5, WAIT).await.unwrap();

    let (steady, boom): (Vec<_>, Vec<_>) =
        results.values().partition(|r| r.task_type == "steady");
    assert_eq!(steady.len(), 3);
    assert!(steady.iter().all(|r| r.success));
    assert_eq!(boom.len(), 2);
    assert!(boom.iter().all(|r| {
        !r.success && r.error.as_deref().unwrap_or_default().contains("boom")
    }));
    // The failures did not serialize the healthy tasks behind them.
    assert!(peak.load(Ordering::SeqCst) >= 2);
    queue.stop().await;
    bus.stop().await;
}

// ---------------------------------------------------------------------------
// Waiting, status, stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn wait_for_unknown_task_times_out() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    let err = queue
        .wait_for_task(EventId::new(), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn workflow_counts_failed_tasks_as_finished() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    queue
        .register_task_handler("step", |data: Value| async move {
            if data["fail"] == true {
                anyhow::bail!("step failed");
            }
            Ok(data)
        })
        .unwrap();

    let ok = queue
        .queue_task("step", json!({"fail": false}), Priority::Medium, Some("wf".into()))
        .await
        .unwrap();
    let bad = queue
        .queue_task("step", json!({"fail": true}), Priority::Medium, Some("wf".into()))
        .await
        .unwrap();

    let results = queue.wait_for_workflow("wf", 2, WAIT).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[&ok].success);
    assert!(!results[&bad].success);
    assert_eq!(results[&bad].attempts, 1);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn workflow_results_are_rebuilt_from_event_history() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    queue
        .register_task_handler("step", |data: Value| async move { Ok(data) })
        .unwrap();
    let task_id = queue
        .queue_task("step", json!({"n": 1}), Priority::Medium, Some("wf-2".into()))
        .await
        .unwrap();
    queue.wait_for_workflow("wf-2", 1, WAIT).await.unwrap();

    // A second queue over the same bus has no local results.
    let other = TaskQueue::new(bus.clone(), queue_config());
    let results = other.wait_for_workflow("wf-2", 1, WAIT).await.unwrap();
    let rebuilt = &results[&task_id];
    assert!(rebuilt.success);
    assert_eq!(rebuilt.task_type, "step");
    assert_eq!(rebuilt.result, Some(json!({"n": 1})));
    assert_eq!(other.task_status(task_id).await, TaskStatus::Unknown);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn workflow_times_out_when_tasks_are_missing() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    queue
        .register_task_handler("step", |data: Value| async move { Ok(data) })
        .unwrap();
    queue
        .queue_task("step", json!({}), Priority::Medium, Some("short".into()))
        .await
        .unwrap();

    let err = queue
        .wait_for_workflow("short", 2, Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn task_status_tracks_a_task_through_execution() {
    let (bus, queue) = setup(bus_config(), queue_config()).await;
    let release = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::clone(&release);
    queue
        .register_task_handler("gated", move |_data: Value| {
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(json!("done"))
            }
        })
        .unwrap();

    assert_eq!(queue.task_status(EventId::new()).await, TaskStatus::Unknown);

    let task_id = queue
        .queue_task("gated", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    let mut active = false;
    for _ in 0..300 {
        if queue.task_status(task_id).await == TaskStatus::Active {
            active = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(active, "task never became active");
    assert_eq!(queue.get_queue_stats().await.active_tasks, 1);

    release.notify_one();
    let result = queue.wait_for_task(task_id, WAIT).await.unwrap();
    assert_eq!(queue.task_status(task_id).await, TaskStatus::Completed(result));
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn stats_report_handlers_and_cached_results() {
    let config = QueueConfig {
        max_concurrent_tasks: 4,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config(), config).await;
    queue
        .register_task_handler("b", |data: Value| async move { Ok(data) })
        .unwrap();
    queue
        .register_task_handler("a", |data: Value| async move { Ok(data) })
        .unwrap();

    let id = queue
        .queue_task("a", json!({}), Priority::Medium, None)
        .await
        .unwrap();
    queue.wait_for_task(id, WAIT).await.unwrap();

    let stats = queue.get_queue_stats().await;
    assert_eq!(stats.task_handlers, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(stats.max_concurrent, 4);
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.result_capacity, 10_000);
    assert_eq!(stats.evicted_results, 0);
    queue.stop().await;
    bus.stop().await;
}

#[tokio::test]
async fn result_cache_is_bounded() {
    let config = QueueConfig {
        result_capacity: 2,
        ..queue_config()
    };
    let (bus, queue) = setup(bus_config(), config).await;
    queue
        .register_task_handler("echo", |data: Value| async move { Ok(data) })
        .unwrap();

    for i in 0..6 {
        queue
            .queue_task("echo", json!(i), Priority::Medium, Some("many".into()))
            .await
            .unwrap();
    }
    queue.wait_for_workflow("many", 6, WAIT).await.unwrap();

    let stats = queue.get_queue_stats().await;
    assert!(stats.completed_tasks <= 2, "cached {}", stats.completed_tasks);
    assert!(stats.evicted_results >= 1);
    queue.stop().await;
    bus.stop().await;
}
