//! Work-unit abstraction.
//!
//! The queue is agnostic to what a task does. A work unit is either a
//! type-erased async closure or a named object implementing [`WorkUnit`];
//! both expose the single `execute(context)` capability the queue depends on.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Execution context handed to a work unit.
///
/// Carries the task identity and the cooperative cancellation flag. Long
/// work units should check [`TaskContext::is_cancelled`] at convenient
/// points, or race their own I/O against [`TaskContext::cancelled`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// The id of the task being executed.
    pub task_id: Uuid,
    /// 1-based attempt number (initial run is attempt 1).
    pub attempt: u32,
    cancel: CancellationToken,
}

impl TaskContext {
    pub(crate) fn new(task_id: Uuid, attempt: u32, cancel: CancellationToken) -> Self {
        Self {
            task_id,
            attempt,
            cancel,
        }
    }

    /// Has cancellation been requested for this task?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// A named work unit.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Execute the unit. Failures are opaque to the core; the original
    /// cause is preserved on the task record.
    async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value>;
}

type InvocationFn = dyn Fn(TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// The opaque invocation a task wraps.
#[derive(Clone)]
pub enum Invocation {
    /// A type-erased async closure.
    Func(Arc<InvocationFn>),
    /// A named work unit object.
    Unit(Arc<dyn WorkUnit>),
}

impl Invocation {
    /// Wrap an async closure as an invocation.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::Func(Arc::new(move |ctx| Box::pin(f(ctx))))
    }

    /// Wrap a [`WorkUnit`] object as an invocation.
    pub fn from_unit(unit: Arc<dyn WorkUnit>) -> Self {
        Self::Unit(unit)
    }

    /// Run the work unit.
    pub async fn execute(&self, ctx: TaskContext) -> anyhow::Result<Value> {
        match self {
            Self::Func(f) => f(ctx).await,
            Self::Unit(u) => u.execute(ctx).await,
        }
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Func(_) => f.write_str("Invocation::Func"),
            Self::Unit(_) => f.write_str("Invocation::Unit"),
        }
    }
}
