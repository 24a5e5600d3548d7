//! Task submission builder.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::invocation::{Invocation, TaskContext};

/// Everything a caller states about a task at submission time.
///
/// Unset options fall back to the queue's configured defaults.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// The work unit to run.
    pub invocation: Invocation,
    /// Explicit id; a fresh v4 uuid is assigned when absent.
    pub id: Option<Uuid>,
    /// Higher is more urgent. Defaults to 0.
    pub priority: i32,
    /// Execution timeout override.
    pub timeout: Option<Duration>,
    /// Retry count override.
    pub retry_count: Option<u32>,
    /// Retry delay override.
    pub retry_delay: Option<Duration>,
    /// Tasks that must complete before this one runs.
    pub dependencies: HashSet<Uuid>,
    /// Named resource amounts to acquire before running.
    pub resource_requirements: Vec<(String, f64)>,
}

impl TaskSpec {
    /// Create a spec for an invocation with all options at their defaults.
    pub fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            id: None,
            priority: 0,
            timeout: None,
            retry_count: None,
            retry_delay: None,
            dependencies: HashSet::new(),
            resource_requirements: Vec::new(),
        }
    }

    /// Convenience: build a spec straight from an async closure.
    pub fn from_fn<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(Invocation::from_fn(f))
    }

    /// Submit under an explicit id.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Retry a failed task `count` times, waiting `delay` before each retry.
    pub fn with_retries(mut self, count: u32, delay: Duration) -> Self {
        self.retry_count = Some(count);
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_dependency(mut self, dep: Uuid) -> Self {
        self.dependencies.insert(dep);
        self
    }

    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = Uuid>) -> Self {
        self.dependencies.extend(deps);
        self
    }

    /// Require `amount` of the named resource while running.
    pub fn with_resource(mut self, resource: impl Into<String>, amount: f64) -> Self {
        self.resource_requirements.push((resource.into(), amount));
        self
    }
}
