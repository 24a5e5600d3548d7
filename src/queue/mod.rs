//! Task queue — priority/dependency-aware execution with bounded concurrency.
//!
//! Core components:
//! - `core` — the scheduling loop that owns all queue state
//! - `stats` — introspection snapshot
//!
//! A [`TaskQueue`] is a cheap cloneable handle to its scheduling loop.
//! Every instance is explicitly constructed and caller-owned; there is no
//! process-wide queue.

mod core;
mod stats;

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, QueueError, Result, TaskError};
use crate::resources::ResourcePool;
use crate::task::record::{FailureCause, TaskRecord};
use crate::task::spec::TaskSpec;

use self::core::{Command, QueueCore, WaitReply};
pub use self::stats::QueueStats;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Handle to a running task queue.
#[derive(Clone)]
pub struct TaskQueue {
    cmd_tx: mpsc::Sender<Command>,
    pool: Arc<ResourcePool>,
}

impl TaskQueue {
    /// Start a queue and its scheduling loop.
    pub fn start(config: QueueConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (done_tx, done_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let pool = Arc::new(ResourcePool::new(config.resource_capacity.clone()));

        tracing::info!(
            max_workers = config.max_workers,
            max_queue_size = config.max_queue_size,
            "Task queue started"
        );
        let core = QueueCore::new(config, pool.clone(), done_tx);
        tokio::spawn(core.run(cmd_rx, done_rx));

        Self { cmd_tx, pool }
    }

    /// Admit a task. Fails synchronously with `QueueError::Full` when the
    /// backlog is at capacity, or `QueueError::Validation` on an unknown
    /// or cyclic dependency or a duplicate live id.
    pub async fn submit(&self, spec: TaskSpec) -> Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Submit { spec, reply: tx }).await?;
        let id = recv(rx).await??;
        Ok(id)
    }

    /// Snapshot of a task's record.
    pub async fn get(&self, id: Uuid) -> Result<TaskRecord> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Get { id, reply: tx }).await?;
        recv(rx).await?.ok_or_else(|| QueueError::NotFound { id }.into())
    }

    /// Cancel a task. Pending/Ready tasks cancel immediately; a Running
    /// task has its cancellation flag set and finishes cooperatively.
    /// Returns false when the task is already terminal.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply: tx }).await?;
        recv(rx).await?.ok_or_else(|| QueueError::NotFound { id }.into())
    }

    /// Suspend until the task settles, then return its result.
    ///
    /// `timeout` bounds the wait itself; the task's own execution timeout
    /// is configured at submission.
    pub async fn await_result(&self, id: Uuid, timeout: Option<Duration>) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Wait { id, reply: tx }).await?;

        let outcome = match recv(rx).await? {
            WaitReply::NotFound => return Err(QueueError::NotFound { id }.into()),
            WaitReply::Settled(outcome) => outcome,
            WaitReply::Waiting(done_rx) => match timeout {
                Some(limit) => match tokio::time::timeout(limit, done_rx).await {
                    Err(_) => {
                        return Err(TaskError::AwaitTimeout { id, timeout: limit }.into());
                    }
                    Ok(done) => done.map_err(|_| QueueError::ShuttingDown)?,
                },
                None => done_rx.await.map_err(|_| QueueError::ShuttingDown)?,
            },
        };

        match outcome {
            Ok(value) => Ok(value),
            Err(FailureCause::Timeout) => Err(TaskError::Timeout { id }.into()),
            Err(FailureCause::Cancelled) => Err(TaskError::Cancelled { id }.into()),
            Err(FailureCause::DependencyFailed { dependency }) => {
                Err(TaskError::DependencyFailed { id, dependency }.into())
            }
            Err(FailureCause::Execution { message }) => {
                Err(TaskError::Failed { id, reason: message }.into())
            }
        }
    }

    /// Per-status counts, worker utilization, resource usage.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats { reply: tx }).await?;
        recv(rx).await
    }

    /// Stop the queue: reject new submissions, cancel queued work, and
    /// drain in-flight tasks. After `grace` (when given), stragglers get a
    /// cooperative cancellation request. Idempotent.
    pub async fn stop(&self, grace: Option<Duration>) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Shutdown { grace, done: tx })
            .await
            .is_err()
        {
            // Loop already gone.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// The queue's resource pool, for external monitoring.
    pub fn resources(&self) -> &Arc<ResourcePool> {
        &self.pool
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::from(QueueError::ShuttingDown))
    }
}

async fn recv<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await.map_err(|_| QueueError::ShuttingDown.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::record::TaskStatus;
    use serde_json::json;
    use std::sync::Mutex;

    fn quick_queue(workers: usize) -> TaskQueue {
        TaskQueue::start(QueueConfig {
            max_workers: workers,
            ..QueueConfig::default()
        })
    }

    #[tokio::test]
    async fn submit_then_get_reports_requested_retry_count() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0, // nothing dispatches; we only inspect admission
            ..QueueConfig::default()
        });

        let id = queue
            .submit(
                TaskSpec::from_fn(|_| async { Ok(Value::Null) })
                    .with_retries(4, Duration::from_millis(10)),
            )
            .await
            .unwrap();

        let rec = queue.get(id).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Ready); // no dependencies
        assert_eq!(rec.retries_remaining, 4);
        assert_eq!(rec.attempts, 0);
    }

    #[tokio::test]
    async fn task_with_dependency_starts_pending() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0,
            ..QueueConfig::default()
        });

        let a = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
            .await
            .unwrap();
        let b = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_dependency(a))
            .await
            .unwrap();

        assert_eq!(queue.get(b).await.unwrap().status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn unknown_dependency_rejected() {
        let queue = quick_queue(1);
        let err = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_dependency(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_live_id_rejected() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0,
            ..QueueConfig::default()
        });
        let id = Uuid::new_v4();
        queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_id(id))
            .await
            .unwrap();
        let err = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_id(id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Queue(QueueError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn queue_full_rejected() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0,
            max_queue_size: 2,
            ..QueueConfig::default()
        });
        for _ in 0..2 {
            queue
                .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
                .await
                .unwrap();
        }
        let err = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::Full { max: 2 })));
    }

    #[tokio::test]
    async fn executes_and_returns_result() {
        let queue = quick_queue(2);
        let id = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(json!({"answer": 42})) }))
            .await
            .unwrap();
        let value = queue.await_result(id, Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(value, json!({"answer": 42}));

        let rec = queue.get(id).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert!(rec.started_at.is_some());
        assert!(rec.completed_at.is_some());
    }

    #[tokio::test]
    async fn higher_priority_dispatches_first() {
        let queue = quick_queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single worker so the next two submissions queue up.
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_task = gate.clone();
        let blocker = queue
            .submit(TaskSpec::from_fn(move |_| {
                let gate = gate_task.clone();
                async move {
                    gate.notified().await;
                    Ok(Value::Null)
                }
            }))
            .await
            .unwrap();

        let low_order = order.clone();
        let low = queue
            .submit(
                TaskSpec::from_fn(move |_| {
                    let order = low_order.clone();
                    async move {
                        order.lock().unwrap().push("low");
                        Ok(Value::Null)
                    }
                })
                .with_priority(1),
            )
            .await
            .unwrap();

        let high_order = order.clone();
        let high = queue
            .submit(
                TaskSpec::from_fn(move |_| {
                    let order = high_order.clone();
                    async move {
                        order.lock().unwrap().push("high");
                        Ok(Value::Null)
                    }
                })
                .with_priority(10),
            )
            .await
            .unwrap();

        gate.notify_one();
        queue.await_result(blocker, Some(Duration::from_secs(5))).await.unwrap();
        queue.await_result(low, Some(Duration::from_secs(5))).await.unwrap();
        queue.await_result(high, Some(Duration::from_secs(5))).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0,
            ..QueueConfig::default()
        });
        let id = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
            .await
            .unwrap();

        assert!(queue.cancel(id).await.unwrap());
        let rec = queue.get(id).await.unwrap();
        assert_eq!(rec.status, TaskStatus::Cancelled);

        // Already terminal: second cancel is a no-op.
        assert!(!queue.cancel(id).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_unknown_task_not_found() {
        let queue = quick_queue(1);
        let err = queue.cancel(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::NotFound { .. })));
    }

    #[tokio::test]
    async fn stats_counts_by_status() {
        let queue = TaskQueue::start(QueueConfig {
            max_workers: 0,
            ..QueueConfig::default()
        });
        let a = queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }))
            .await
            .unwrap();
        queue
            .submit(TaskSpec::from_fn(|_| async { Ok(Value::Null) }).with_dependency(a))
            .await
            .unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.depth, 2);
        assert_eq!(stats.ready, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.submitted_total, 2);
        assert_eq!(stats.worker_utilization(), 0.0);
    }
}
