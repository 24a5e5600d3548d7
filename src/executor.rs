//! Dependency- and resource-aware batch executor.
//!
//! Drives a fixed batch of interdependent tasks to completion, composing
//! the dependency graph, the resource pool, and a bounded dispatch loop.
//! Unlike the queue, the batch is closed at execution time: `execute_all`
//! consumes the executor and returns once every task is terminal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ExecutorError;
use crate::graph::DependencyGraph;
use crate::resources::ResourcePool;
use crate::task::invocation::{Invocation, TaskContext};
use crate::task::record::FailureCause;
use crate::task::spec::TaskSpec;

struct BatchTask {
    invocation: Invocation,
    priority: i32,
    resource_requirements: Vec<(String, f64)>,
    timeout: Option<Duration>,
}

/// Outcome map: every task in the batch gets exactly one entry.
pub type BatchResults = HashMap<Uuid, Result<Value, FailureCause>>;

/// Executes a fixed batch of interdependent tasks.
#[derive(Default)]
pub struct ParallelTaskExecutor {
    tasks: HashMap<Uuid, BatchTask>,
    /// Insertion order; frontier dispatch is deterministic.
    order: Vec<Uuid>,
    graph: DependencyGraph,
    pool: Option<Arc<ResourcePool>>,
}

impl ParallelTaskExecutor {
    /// Executor without resource gating.
    pub fn new() -> Self {
        Self::default()
    }

    /// Executor gating dispatch on a resource pool. The pool may be shared
    /// with other components; the executor is woken when they release.
    pub fn with_pool(pool: Arc<ResourcePool>) -> Self {
        Self {
            pool: Some(pool),
            ..Self::default()
        }
    }

    /// Executor with its own pool of the given capacities.
    pub fn with_capacity(capacity: HashMap<String, f64>) -> Self {
        Self::with_pool(Arc::new(ResourcePool::new(capacity)))
    }

    /// Add a task to the batch. Dependencies must reference tasks already
    /// added; the id is taken from the spec (fresh when unset).
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<Uuid, ExecutorError> {
        let id = spec.id.unwrap_or_else(Uuid::new_v4);
        if self.tasks.contains_key(&id) {
            return Err(ExecutorError::DuplicateTask { id });
        }
        for &dep in &spec.dependencies {
            if !self.tasks.contains_key(&dep) {
                return Err(ExecutorError::UnknownDependency {
                    id,
                    dependency: dep,
                });
            }
        }

        self.graph.add_node(id);
        for &dep in &spec.dependencies {
            if let Err(e) = self.graph.add_dependency(id, dep) {
                self.graph.remove(id);
                return Err(e.into());
            }
        }

        self.tasks.insert(
            id,
            BatchTask {
                invocation: spec.invocation,
                priority: spec.priority,
                resource_requirements: spec.resource_requirements,
                timeout: spec.timeout,
            },
        );
        self.order.push(id);
        Ok(id)
    }

    /// Number of tasks in the batch.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run the whole batch with at most `max_concurrency` tasks in flight,
    /// returning once every task is terminal.
    ///
    /// A failed task never aborts the batch: its dependents are skipped
    /// and reported with a DependencyFailed cause. Tasks whose resource
    /// allocation fails stay pending and are retried when a release frees
    /// capacity.
    pub async fn execute_all(mut self, max_concurrency: usize) -> BatchResults {
        let max_concurrency = max_concurrency.max(1);
        let total = self.tasks.len();
        let mut results: BatchResults = HashMap::new();
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut running: HashSet<Uuid> = HashSet::new();

        // Keep one sender alive locally so the channel never closes.
        let (done_tx, mut done_rx) = mpsc::channel::<(Uuid, Result<Value, FailureCause>)>(
            max_concurrency.max(16),
        );

        tracing::info!(tasks = total, max_concurrency, "Batch execution started");

        while results.len() < total {
            self.skip_failed_dependents(&mut results);
            if results.len() >= total {
                break;
            }

            // Frontier: dependencies satisfied, not yet started or settled.
            let ready = self.graph.get_ready(&completed);
            let mut frontier: Vec<Uuid> = self
                .order
                .iter()
                .filter(|id| ready.contains(*id))
                .filter(|id| !running.contains(*id) && !results.contains_key(*id))
                .copied()
                .collect();
            frontier.sort_by_key(|id| std::cmp::Reverse(self.tasks[id].priority));

            let mut settled_unrunnable = false;
            for id in frontier {
                if running.len() >= max_concurrency {
                    break;
                }
                let task = &self.tasks[&id];
                if let Some(pool) = &self.pool {
                    if let Err(e) = pool.can_ever_satisfy(&task.resource_requirements) {
                        results.insert(
                            id,
                            Err(FailureCause::Execution {
                                message: e.to_string(),
                            }),
                        );
                        settled_unrunnable = true;
                        continue;
                    }
                    if !pool.try_allocate(id, &task.resource_requirements) {
                        // Stays pending; a release wakes the loop.
                        continue;
                    }
                }
                self.dispatch(id, done_tx.clone());
                running.insert(id);
            }

            // An unsatisfiable requirement settles the task without running
            // it; restart the pass so its dependents get skipped too.
            if settled_unrunnable {
                continue;
            }

            if running.is_empty() {
                // Nothing in flight: blocked on capacity held elsewhere.
                match &self.pool {
                    Some(pool) => pool.wait_release().await,
                    None => unreachable!("no running tasks and no resource gating"),
                }
                continue;
            }

            let Some((id, outcome)) = done_rx.recv().await else {
                break;
            };
            running.remove(&id);
            if let Some(pool) = &self.pool {
                pool.release(id);
            }
            match &outcome {
                Ok(_) => {
                    tracing::debug!(task_id = %id, "Batch task completed");
                    completed.insert(id);
                }
                Err(cause) => {
                    tracing::warn!(task_id = %id, cause = ?cause, "Batch task did not complete");
                }
            }
            results.insert(id, outcome);
        }

        debug_assert_eq!(results.len(), total, "batch ended with unreported tasks");
        tracing::info!(
            completed = completed.len(),
            failed = total - completed.len(),
            "Batch execution finished"
        );
        results
    }

    /// Report tasks whose prerequisite ended non-Completed, transitively.
    fn skip_failed_dependents(&self, results: &mut BatchResults) {
        loop {
            let mut changed = false;
            for &id in &self.order {
                if results.contains_key(&id) {
                    continue;
                }
                let failed_dep = self
                    .graph
                    .dependencies(id)
                    .into_iter()
                    .find(|dep| matches!(results.get(dep), Some(Err(_))));
                if let Some(dep) = failed_dep {
                    tracing::debug!(task_id = %id, dependency = %dep, "Skipping dependent of failed task");
                    results.insert(id, Err(FailureCause::DependencyFailed { dependency: dep }));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn dispatch(&self, id: Uuid, done_tx: mpsc::Sender<(Uuid, Result<Value, FailureCause>)>) {
        let task = &self.tasks[&id];
        let invocation = task.invocation.clone();
        let timeout = task.timeout;
        let cancel = CancellationToken::new();
        let ctx = TaskContext::new(id, 1, cancel.clone());

        tracing::debug!(task_id = %id, "Batch task dispatched");
        tokio::spawn(async move {
            let work = invocation.execute(ctx);
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => Err(FailureCause::Execution {
                        message: format!("{error:#}"),
                    }),
                    Err(_) => {
                        cancel.cancel();
                        Err(FailureCause::Timeout)
                    }
                },
                None => match work.await {
                    Ok(value) => Ok(value),
                    Err(error) => Err(FailureCause::Execution {
                        message: format!("{error:#}"),
                    }),
                },
            };
            let _ = done_tx.send((id, outcome)).await;
        });
    }
}
