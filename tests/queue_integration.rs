//! End-to-end tests across the queue, scheduler, executor, and breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use uuid::Uuid;

use taskcore::breaker::{BreakerState, CircuitBreaker};
use taskcore::config::{BreakerConfig, QueueConfig, SchedulerConfig};
use taskcore::error::{Error, TaskError};
use taskcore::executor::ParallelTaskExecutor;
use taskcore::queue::TaskQueue;
use taskcore::scheduler::TaskScheduler;
use taskcore::task::{TaskSpec, TaskStatus};

/// Install a subscriber once so RUST_LOG surfaces core tracing in tests.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_target(false)
            .try_init();
    });
}

fn default_queue() -> TaskQueue {
    init_tracing();
    TaskQueue::start(QueueConfig::default())
}

#[tokio::test]
async fn dependency_chain_runs_in_order_and_delivers_results() {
    let queue = default_queue();
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let l = log.clone();
    let fetch = queue
        .submit(TaskSpec::from_fn(move |_| {
            let l = l.clone();
            async move {
                l.lock().unwrap().push("fetch");
                Ok(json!({"rows": 3}))
            }
        }))
        .await
        .unwrap();

    let l = log.clone();
    let transform = queue
        .submit(
            TaskSpec::from_fn(move |_| {
                let l = l.clone();
                async move {
                    l.lock().unwrap().push("transform");
                    Ok(json!({"rows": 3, "clean": true}))
                }
            })
            .with_dependency(fetch),
        )
        .await
        .unwrap();

    let l = log.clone();
    let publish = queue
        .submit(
            TaskSpec::from_fn(move |_| {
                let l = l.clone();
                async move {
                    l.lock().unwrap().push("publish");
                    Ok(Value::Null)
                }
            })
            .with_dependency(transform),
        )
        .await
        .unwrap();

    queue
        .await_result(publish, Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["fetch", "transform", "publish"]);

    // A task never reached Running before its dependency completed; the
    // terminal records agree.
    for id in [fetch, transform, publish] {
        let rec = queue.get(id).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn always_failing_task_attempts_initial_plus_retries() {
    let queue = default_queue();
    let attempts = Arc::new(AtomicU32::new(0));

    let a = attempts.clone();
    let id = queue
        .submit(
            TaskSpec::from_fn(move |_| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    Err(anyhow::anyhow!("flaky dependency"))
                }
            })
            .with_retries(2, Duration::from_millis(10)),
        )
        .await
        .unwrap();

    let err = queue
        .await_result(id, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::Failed { .. })));

    // 1 initial + 2 retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let rec = queue.get(id).await.unwrap();
    assert_eq!(rec.status, TaskStatus::Failed);
    assert_eq!(rec.retries_remaining, 0);
    assert_eq!(rec.attempts, 3);
}

#[tokio::test]
async fn retry_eventually_succeeds() {
    let queue = default_queue();
    let attempts = Arc::new(AtomicU32::new(0));

    let a = attempts.clone();
    let id = queue
        .submit(
            TaskSpec::from_fn(move |_| {
                let a = a.clone();
                async move {
                    if a.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(anyhow::anyhow!("not yet"))
                    } else {
                        Ok(json!("recovered"))
                    }
                }
            })
            .with_retries(5, Duration::from_millis(10)),
        )
        .await
        .unwrap();

    let value = queue
        .await_result(id, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(value, json!("recovered"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.retried_total, 2);
}

#[tokio::test]
async fn task_timeout_is_terminal_with_timeout_cause() {
    let queue = default_queue();
    let attempts = Arc::new(AtomicU32::new(0));

    let a = attempts.clone();
    let id = queue
        .submit(
            TaskSpec::from_fn(move |_| {
                let a = a.clone();
                async move {
                    a.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
            })
            .with_timeout(Duration::from_millis(30))
            // Timeouts are not retried; retries cover execution failures.
            .with_retries(3, Duration::from_millis(10)),
        )
        .await
        .unwrap();

    let err = queue
        .await_result(id, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::Timeout { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelling_running_task_is_cooperative() {
    let queue = default_queue();

    let id = queue
        .submit(TaskSpec::from_fn(|ctx| async move {
            // Observe the cancellation flag, as a well-behaved unit should.
            ctx.cancelled().await;
            Ok(Value::Null)
        }))
        .await
        .unwrap();

    // Let it reach Running, then request cancellation.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.get(id).await.unwrap().status, TaskStatus::Running);
    assert!(queue.cancel(id).await.unwrap());

    let err = queue
        .await_result(id, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::Cancelled { .. })));
    assert_eq!(queue.get(id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn dependents_of_failed_task_are_skipped_not_dropped() {
    let queue = default_queue();

    let root = queue
        .submit(TaskSpec::from_fn(|_| async {
            Err(anyhow::anyhow!("root failure"))
        }))
        .await
        .unwrap();
    let child = queue
        .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_dependency(root))
        .await
        .unwrap();
    let grandchild = queue
        .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_dependency(child))
        .await
        .unwrap();

    let err = queue
        .await_result(grandchild, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    match err {
        Error::Task(TaskError::DependencyFailed { dependency, .. }) => {
            assert_eq!(dependency, child);
        }
        other => panic!("expected DependencyFailed, got {other}"),
    }

    let rec = queue.get(child).await.unwrap();
    assert_eq!(rec.status, TaskStatus::Failed);
}

#[tokio::test]
async fn resource_gated_tasks_reuse_capacity_after_release() {
    let queue = TaskQueue::start(QueueConfig {
        max_workers: 4,
        resource_capacity: HashMap::from([("cpu".to_string(), 1.0)]),
        ..QueueConfig::default()
    });

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            queue
                .submit(
                    TaskSpec::from_fn(|_| async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Value::Null)
                    })
                    .with_resource("cpu", 0.6),
                )
                .await
                .unwrap(),
        );
    }

    for id in ids {
        queue
            .await_result(id, Some(Duration::from_secs(5)))
            .await
            .unwrap();
    }

    // Everything released once terminal.
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.resources["cpu"].allocated, 0.0);
}

#[tokio::test]
async fn stop_drains_in_flight_work() {
    let queue = default_queue();
    let finished = Arc::new(AtomicU32::new(0));

    let f = finished.clone();
    let running = queue
        .submit(TaskSpec::from_fn(move |_| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                f.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        }))
        .await
        .unwrap();

    // Give it time to start, then stop with a generous grace.
    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.stop(Some(Duration::from_secs(5))).await.unwrap();

    assert_eq!(finished.load(Ordering::SeqCst), 1);

    // New submissions are rejected after stop.
    let err = queue
        .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Queue(_)));
    let _ = running;
}

#[tokio::test]
async fn scheduler_feeds_queue_on_interval() {
    let queue = default_queue();
    let scheduler = TaskScheduler::start(
        SchedulerConfig {
            tick_interval: Duration::from_millis(10),
        },
        queue.clone(),
    );
    let fires = Arc::new(AtomicU32::new(0));

    let f = fires.clone();
    scheduler
        .schedule_every(
            TaskSpec::from_fn(move |_| {
                let f = f.clone();
                async move {
                    f.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }),
            Duration::from_millis(25),
            Some(3),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(fires.load(Ordering::SeqCst), 3);

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    scheduler.stop().await.unwrap();
}

#[tokio::test]
async fn executor_batch_with_shared_queue_results() {
    // A batch whose results a collaborator folds back into queue work.
    let mut exec = ParallelTaskExecutor::with_capacity(HashMap::from([(
        "slots".to_string(),
        2.0,
    )]));

    let ids: Vec<Uuid> = (0..4)
        .map(|i| {
            exec.add_task(
                TaskSpec::from_fn(move |_| async move { Ok(json!(i)) })
                    .with_resource("slots", 1.0),
            )
            .unwrap()
        })
        .collect();

    let results = exec.execute_all(8).await;
    assert_eq!(results.len(), 4);
    for id in &ids {
        assert!(results[id].is_ok());
    }

    let queue = default_queue();
    let total: i64 = results
        .values()
        .map(|r| r.as_ref().unwrap().as_i64().unwrap())
        .sum();
    let follow_up = queue
        .submit(TaskSpec::from_fn(move |_| async move { Ok(json!(total)) }))
        .await
        .unwrap();
    assert_eq!(
        queue
            .await_result(follow_up, Some(Duration::from_secs(5)))
            .await
            .unwrap(),
        json!(6)
    );
}

#[tokio::test]
async fn breaker_guards_a_flaky_call_site() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 2,
        timeout: Duration::from_millis(40),
        half_open_max_calls: 1,
    });

    // Two consecutive failures trip it.
    for _ in 0..2 {
        let _: anyhow::Result<Value> = breaker
            .call(async { Err(anyhow::anyhow!("upstream down")) })
            .await;
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.allow_request());

    // After the window, a single successful trial closes it.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let value: anyhow::Result<Value> = breaker.call(async { Ok(json!("pong")) }).await;
    assert_eq!(value.unwrap(), json!("pong"));
    assert_eq!(breaker.state(), BreakerState::Closed);
}

#[tokio::test]
async fn breaker_inside_queue_work_unit() {
    let queue = default_queue();
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
        failure_threshold: 1,
        timeout: Duration::from_secs(30),
        half_open_max_calls: 1,
    }));

    // Trip the breaker, then submit a task that consults it.
    breaker.record_failure(&anyhow::anyhow!("dead upstream"));

    let b = breaker.clone();
    let id = queue
        .submit(TaskSpec::from_fn(move |_| {
            let b = b.clone();
            async move {
                b.call(async { Ok(json!("unreachable")) }).await
            }
        }))
        .await
        .unwrap();

    let err = queue
        .await_result(id, Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    // The breaker's fast-fail surfaced as the task's own failure.
    assert!(matches!(err, Error::Task(TaskError::Failed { .. })));
}
