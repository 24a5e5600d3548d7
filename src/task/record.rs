//! Task state machine and record.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::invocation::Invocation;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on dependencies.
    Pending,
    /// Eligible for dispatch.
    Ready,
    /// Currently executing on a worker.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// Transitions are monotonic; Pending is never revisited. The
    /// `Failed -> Ready` edge is the retry path and is only taken while
    /// retries remain; `Failed -> Cancelled` covers cancelling a task
    /// whose retry is still pending.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Ready) | (Pending, Cancelled) | (Pending, Failed) |
            (Ready, Running) | (Ready, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            // Retry path
            (Failed, Ready) | (Failed, Cancelled)
        )
    }

    /// Check if this is a terminal status.
    ///
    /// Failed counts as terminal here; whether a failed task is *settled*
    /// additionally depends on a pending retry (see [`TaskRecord::is_settled`]).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Structured cause recorded on a task that did not complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The work unit itself failed.
    Execution { message: String },
    /// The task exceeded its execution timeout.
    Timeout,
    /// The task was cancelled.
    Cancelled,
    /// A prerequisite ended without completing.
    DependencyFailed { dependency: Uuid },
}

/// A task admitted to a queue.
///
/// Mutated only by the owning scheduling loop; callers observe snapshots
/// via `get()`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    /// Unique task id.
    pub id: Uuid,
    /// Current status.
    pub status: TaskStatus,
    /// Higher is more urgent.
    pub priority: i32,
    /// Ids that must reach Completed before this task runs.
    pub dependencies: HashSet<Uuid>,
    /// Named resource amounts acquired atomically before Running.
    pub resource_requirements: Vec<(String, f64)>,
    /// Execution timeout (None = unbounded).
    pub timeout: Option<Duration>,
    /// Retries remaining. Decrements only on the Failed -> Ready transition.
    pub retries_remaining: u32,
    /// Base delay before a retry.
    pub retry_delay: Duration,
    /// Attempts made so far (incremented when the task enters Running).
    pub attempts: u32,
    /// Result of a completed task.
    pub result: Option<Value>,
    /// Cause recorded on a failed, cancelled, or skipped task.
    pub failure: Option<FailureCause>,
    /// When the next retry becomes due, while one is pending.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Submission sequence, ties broken oldest-first within a priority.
    #[serde(skip)]
    pub(crate) seq: u64,
    #[serde(skip)]
    pub(crate) invocation: Invocation,
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl TaskRecord {
    pub(crate) fn new(id: Uuid, invocation: Invocation, seq: u64) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            priority: 0,
            dependencies: HashSet::new(),
            resource_requirements: Vec::new(),
            timeout: None,
            retries_remaining: 0,
            retry_delay: Duration::from_secs(2),
            attempts: 0,
            result: None,
            failure: None,
            next_retry_at: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq,
            invocation,
            cancel: CancellationToken::new(),
        }
    }

    fn transition(&mut self, to: TaskStatus) {
        debug_assert!(
            self.status.can_transition_to(to),
            "invalid task transition {} -> {}",
            self.status,
            to
        );
        self.status = to;
    }

    /// Pending -> Ready, once every dependency has completed.
    pub(crate) fn mark_ready(&mut self) {
        self.transition(TaskStatus::Ready);
    }

    /// Ready -> Running. Increments the attempt counter.
    pub(crate) fn start_attempt(&mut self) {
        self.transition(TaskStatus::Running);
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Running -> Completed with a result.
    pub(crate) fn mark_completed(&mut self, result: Value) {
        self.transition(TaskStatus::Completed);
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Failed with a structured cause.
    pub(crate) fn mark_failed(&mut self, cause: FailureCause) {
        self.transition(TaskStatus::Failed);
        self.failure = Some(cause);
        self.completed_at = Some(Utc::now());
    }

    /// Transition to Cancelled.
    pub(crate) fn mark_cancelled(&mut self) {
        self.transition(TaskStatus::Cancelled);
        self.failure = Some(FailureCause::Cancelled);
        self.next_retry_at = None;
        self.completed_at = Some(Utc::now());
    }

    /// Record a failure that will be retried at `due`.
    pub(crate) fn schedule_retry(&mut self, cause: FailureCause, due: DateTime<Utc>) {
        debug_assert!(self.retries_remaining > 0, "retry scheduled with none remaining");
        self.transition(TaskStatus::Failed);
        self.failure = Some(cause);
        self.next_retry_at = Some(due);
    }

    /// Failed -> Ready when the retry delay has elapsed.
    pub(crate) fn requeue_for_retry(&mut self) {
        debug_assert!(self.next_retry_at.is_some(), "requeue without a pending retry");
        self.transition(TaskStatus::Ready);
        self.retries_remaining = self.retries_remaining.saturating_sub(1);
        self.failure = None;
        self.next_retry_at = None;
        self.completed_at = None;
    }

    /// Terminal with no retry pending: the task will never run again.
    pub fn is_settled(&self) -> bool {
        self.status.is_terminal() && self.next_retry_at.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> TaskRecord {
        let inv = Invocation::from_fn(|_| async { Ok(Value::Null) });
        TaskRecord::new(Uuid::new_v4(), inv, 0)
    }

    #[test]
    fn status_transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Failed.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Ready.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn lifecycle_timestamps() {
        let mut rec = record();
        rec.mark_ready();
        assert!(rec.started_at.is_none());

        rec.start_attempt();
        assert_eq!(rec.attempts, 1);
        assert!(rec.started_at.is_some());

        rec.mark_completed(json!("ok"));
        assert!(rec.completed_at.is_some());
        assert!(rec.is_settled());
    }

    #[test]
    fn retry_cycle_decrements_once() {
        let mut rec = record();
        rec.retries_remaining = 2;
        rec.mark_ready();
        rec.start_attempt();

        rec.schedule_retry(
            FailureCause::Execution {
                message: "boom".into(),
            },
            Utc::now(),
        );
        assert_eq!(rec.status, TaskStatus::Failed);
        assert!(!rec.is_settled());
        assert_eq!(rec.retries_remaining, 2);

        rec.requeue_for_retry();
        assert_eq!(rec.status, TaskStatus::Ready);
        assert_eq!(rec.retries_remaining, 1);
        assert!(rec.failure.is_none());
    }

    #[test]
    fn cancelled_while_retry_pending() {
        let mut rec = record();
        rec.retries_remaining = 1;
        rec.mark_ready();
        rec.start_attempt();
        rec.schedule_retry(
            FailureCause::Execution {
                message: "boom".into(),
            },
            Utc::now(),
        );

        rec.mark_cancelled();
        assert_eq!(rec.status, TaskStatus::Cancelled);
        assert!(rec.is_settled());
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Running);
    }
}
