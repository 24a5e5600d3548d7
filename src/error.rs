//! Error types for the task core.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the task core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Queue-level errors, returned synchronously from the offending call.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue is full: {max} tasks already admitted")]
    Full { max: usize },

    #[error("Invalid submission: {reason}")]
    Validation { reason: String },

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Queue is shutting down")]
    ShuttingDown,
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Schedule {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid schedule: {reason}")]
    Validation { reason: String },

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}

/// Dependency graph errors.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Dependency would create a cycle: {path:?}")]
    Cycle { path: Vec<Uuid> },

    #[error("Unknown node {id}")]
    UnknownNode { id: Uuid },
}

/// Resource pool errors.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Unknown resource type '{resource}'")]
    Unknown { resource: String },

    #[error("Requirement for '{resource}' ({amount}) exceeds total capacity ({capacity})")]
    Unsatisfiable {
        resource: String,
        amount: f64,
        capacity: f64,
    },
}

/// Batch executor errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Task {id} already added to this batch")]
    DuplicateTask { id: Uuid },

    #[error("Task {id} depends on unknown task {dependency}")]
    UnknownDependency { id: Uuid, dependency: Uuid },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Circuit breaker errors.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError {
    #[error("Circuit breaker is open")]
    Open,
}

/// Task-level errors, surfaced only through `await_result` for that task.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },

    #[error("Task {id} timed out")]
    Timeout { id: Uuid },

    #[error("Task {id} was cancelled")]
    Cancelled { id: Uuid },

    #[error("Task {id} skipped: dependency {dependency} did not complete")]
    DependencyFailed { id: Uuid, dependency: Uuid },

    #[error("Timed out after {timeout:?} waiting for task {id}")]
    AwaitTimeout { id: Uuid, timeout: Duration },
}

/// Result type alias for the task core.
pub type Result<T> = std::result::Result<T, Error>;
