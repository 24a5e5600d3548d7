//! Queue scheduling loop.
//!
//! All queue bookkeeping (records, dependency graph, ready heap, retry
//! timers) is owned by a single loop task and mutated nowhere else.
//! Callers talk to it through commands; workers report back through a
//! completion channel. Suspension happens only at the select points:
//! waiting for a command, a worker completion, a retry deadline, or the
//! shutdown grace deadline.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::graph::DependencyGraph;
use crate::resources::ResourcePool;
use crate::task::invocation::{Invocation, TaskContext};
use crate::task::record::{FailureCause, TaskRecord, TaskStatus};
use crate::task::spec::TaskSpec;

use super::stats::QueueStats;

/// Terminal outcome delivered to `await_result` callers.
pub(crate) type TaskOutcome = Result<Value, FailureCause>;

/// Commands from queue handles to the scheduling loop.
pub(crate) enum Command {
    Submit {
        spec: TaskSpec,
        reply: oneshot::Sender<Result<Uuid, QueueError>>,
    },
    Get {
        id: Uuid,
        reply: oneshot::Sender<Option<TaskRecord>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Option<bool>>,
    },
    Wait {
        id: Uuid,
        reply: oneshot::Sender<WaitReply>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Shutdown {
        grace: Option<Duration>,
        done: oneshot::Sender<()>,
    },
}

pub(crate) enum WaitReply {
    NotFound,
    Settled(TaskOutcome),
    Waiting(oneshot::Receiver<TaskOutcome>),
}

/// Worker completion report.
pub(crate) struct WorkerDone {
    id: Uuid,
    outcome: WorkerOutcome,
}

enum WorkerOutcome {
    Success(Value),
    Failure(String),
    TimedOut,
    Cancelled,
}

/// Ready-heap entry: highest priority first, oldest submission first
/// within a priority level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadyEntry {
    priority: i32,
    seq: u64,
    id: Uuid,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct ShutdownState {
    done: Vec<oneshot::Sender<()>>,
    deadline: Option<Instant>,
    stragglers_cancelled: bool,
}

pub(crate) struct QueueCore {
    config: QueueConfig,
    records: HashMap<Uuid, TaskRecord>,
    graph: DependencyGraph,
    completed: HashSet<Uuid>,
    ready: BinaryHeap<ReadyEntry>,
    retries: BinaryHeap<Reverse<(Instant, Uuid)>>,
    waiters: HashMap<Uuid, Vec<oneshot::Sender<TaskOutcome>>>,
    pool: Arc<ResourcePool>,
    done_tx: mpsc::Sender<WorkerDone>,
    workers_busy: usize,
    /// Admitted, not yet settled.
    live: usize,
    next_seq: u64,
    submitted_total: u64,
    retried_total: u64,
    shutdown: Option<ShutdownState>,
    cmd_closed: bool,
}

impl QueueCore {
    pub(crate) fn new(
        config: QueueConfig,
        pool: Arc<ResourcePool>,
        done_tx: mpsc::Sender<WorkerDone>,
    ) -> Self {
        Self {
            config,
            records: HashMap::new(),
            graph: DependencyGraph::new(),
            completed: HashSet::new(),
            ready: BinaryHeap::new(),
            retries: BinaryHeap::new(),
            waiters: HashMap::new(),
            pool,
            done_tx,
            workers_busy: 0,
            live: 0,
            next_seq: 0,
            submitted_total: 0,
            retried_total: 0,
            shutdown: None,
            cmd_closed: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut done_rx: mpsc::Receiver<WorkerDone>,
    ) {
        loop {
            self.dispatch_ready();

            if let Some(shutdown) = &mut self.shutdown
                && self.workers_busy == 0
            {
                for tx in shutdown.done.drain(..) {
                    let _ = tx.send(());
                }
                tracing::info!("Queue drained and stopped");
                break;
            }

            let next_retry = self.retries.peek().map(|Reverse((at, _))| *at);
            let grace = self.shutdown.as_ref().and_then(|s| {
                if s.stragglers_cancelled {
                    None
                } else {
                    s.deadline
                }
            });

            tokio::select! {
                cmd = recv_command(&mut cmd_rx, self.cmd_closed) => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle dropped; drain what is in flight.
                        self.cmd_closed = true;
                        if self.shutdown.is_none() {
                            self.begin_shutdown(None, None);
                        }
                    }
                },
                Some(done) = done_rx.recv() => self.on_worker_done(done),
                _ = sleep_until_opt(next_retry) => self.on_retries_due(),
                _ = sleep_until_opt(grace) => self.on_grace_expired(),
            }
        }
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Submit { spec, reply } => {
                let _ = reply.send(self.admit(spec));
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.records.get(&id).cloned());
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::Wait { id, reply } => {
                let msg = match self.records.get(&id) {
                    None => WaitReply::NotFound,
                    Some(rec) if rec.is_settled() => WaitReply::Settled(outcome_of(rec)),
                    Some(_) => {
                        let (tx, rx) = oneshot::channel();
                        self.waiters.entry(id).or_default().push(tx);
                        WaitReply::Waiting(rx)
                    }
                };
                let _ = reply.send(msg);
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { grace, done } => {
                self.begin_shutdown(grace, Some(done));
            }
        }
    }

    /// Validate and admit a submission.
    fn admit(&mut self, spec: TaskSpec) -> Result<Uuid, QueueError> {
        if self.shutdown.is_some() {
            return Err(QueueError::ShuttingDown);
        }
        if self.live >= self.config.max_queue_size {
            return Err(QueueError::Full {
                max: self.config.max_queue_size,
            });
        }

        let id = spec.id.unwrap_or_else(Uuid::new_v4);
        if let Some(existing) = self.records.get(&id) {
            if !existing.is_settled() {
                return Err(QueueError::Validation {
                    reason: format!("task id {id} is already admitted"),
                });
            }
            // Re-admission of a settled id (e.g. a collaborator replaying a
            // persisted snapshot): retire the old bookkeeping first. Not
            // allowed while another live task still depends on the old run.
            let live_dependent = self
                .graph
                .dependents(id)
                .into_iter()
                .any(|child| self.records.get(&child).is_some_and(|r| !r.is_settled()));
            if live_dependent {
                return Err(QueueError::Validation {
                    reason: format!("task id {id} still has live dependents"),
                });
            }
            self.graph.remove(id);
            self.completed.remove(&id);
        }

        // A dependency that already settled without completing fails the
        // new task immediately rather than stranding it in Pending.
        let mut settled_failed_dep = None;
        for &dep in &spec.dependencies {
            match self.records.get(&dep) {
                None => {
                    return Err(QueueError::Validation {
                        reason: format!("unknown dependency {dep}"),
                    });
                }
                Some(dep_rec) => {
                    if dep_rec.is_settled() && dep_rec.status != TaskStatus::Completed {
                        settled_failed_dep = Some(dep);
                    }
                }
            }
        }

        if !spec.resource_requirements.is_empty()
            && let Err(e) = self.pool.can_ever_satisfy(&spec.resource_requirements)
        {
            return Err(QueueError::Validation {
                reason: e.to_string(),
            });
        }

        let seq = self.next_seq;
        self.next_seq += 1;

        let mut rec = TaskRecord::new(id, spec.invocation, seq);
        rec.priority = spec.priority;
        rec.timeout = spec.timeout.or(self.config.default_timeout);
        rec.retries_remaining = spec.retry_count.unwrap_or(self.config.default_retry_count);
        rec.retry_delay = spec.retry_delay.unwrap_or(self.config.default_retry_delay);
        rec.dependencies = spec.dependencies.clone();
        rec.resource_requirements = spec.resource_requirements;

        self.graph.add_node(id);
        for &dep in &spec.dependencies {
            if self.graph.contains(dep)
                && let Err(e) = self.graph.add_dependency(id, dep)
            {
                self.graph.remove(id);
                return Err(QueueError::Validation {
                    reason: e.to_string(),
                });
            }
        }

        self.records.insert(id, rec);
        self.live += 1;
        self.submitted_total += 1;
        tracing::debug!(
            task_id = %id,
            priority = self.records[&id].priority,
            deps = self.records[&id].dependencies.len(),
            "Task submitted"
        );

        if let Some(dep) = settled_failed_dep {
            self.fail_task(id, FailureCause::DependencyFailed { dependency: dep });
        } else if self.deps_satisfied(id) {
            let rec = self.records.get_mut(&id).expect("record just inserted");
            rec.mark_ready();
            self.push_ready(id);
        }

        Ok(id)
    }

    fn deps_satisfied(&self, id: Uuid) -> bool {
        self.records[&id].dependencies.is_subset(&self.completed)
    }

    fn push_ready(&mut self, id: Uuid) {
        let rec = &self.records[&id];
        self.ready.push(ReadyEntry {
            priority: rec.priority,
            seq: rec.seq,
            id,
        });
    }

    /// Pull the highest-priority ready task into each free worker slot.
    /// Tasks whose resource allocation fails stay ready and are retried on
    /// the next pass (every release happens inside this loop, so a release
    /// always precedes a new dispatch pass).
    fn dispatch_ready(&mut self) {
        let mut blocked = Vec::new();
        while self.workers_busy < self.config.max_workers {
            let Some(entry) = self.ready.pop() else { break };
            let Some(rec) = self.records.get(&entry.id) else {
                continue;
            };
            // Stale entries (cancelled tasks, re-admitted ids) are dropped lazily.
            if rec.status != TaskStatus::Ready || rec.seq != entry.seq {
                continue;
            }
            if !rec.resource_requirements.is_empty()
                && !self.pool.try_allocate(entry.id, &rec.resource_requirements)
            {
                blocked.push(entry);
                continue;
            }
            self.spawn_worker(entry.id);
        }
        for entry in blocked {
            self.ready.push(entry);
        }
    }

    fn spawn_worker(&mut self, id: Uuid) {
        let rec = self.records.get_mut(&id).expect("dispatching known task");
        rec.start_attempt();
        self.workers_busy += 1;

        let invocation = rec.invocation.clone();
        let cancel = rec.cancel.clone();
        let ctx = TaskContext::new(id, rec.attempts, cancel.clone());
        let timeout = rec.timeout;
        let attempt = rec.attempts;
        let done_tx = self.done_tx.clone();

        tracing::debug!(task_id = %id, attempt, "Task dispatched");
        tokio::spawn(async move {
            let outcome = execute_task(invocation, ctx, timeout, cancel).await;
            let _ = done_tx.send(WorkerDone { id, outcome }).await;
        });
    }

    fn on_worker_done(&mut self, done: WorkerDone) {
        self.workers_busy = self.workers_busy.saturating_sub(1);
        self.pool.release(done.id);

        let Some(rec) = self.records.get_mut(&done.id) else {
            return;
        };

        match done.outcome {
            WorkerOutcome::Success(value) => {
                rec.mark_completed(value.clone());
                tracing::info!(task_id = %done.id, "Task completed");
                self.completed.insert(done.id);
                self.settle(done.id, Ok(value));
                self.promote_dependents(done.id);
            }
            WorkerOutcome::Cancelled => {
                rec.mark_cancelled();
                tracing::info!(task_id = %done.id, "Task cancelled");
                self.settle(done.id, Err(FailureCause::Cancelled));
                self.cascade_dependency_failure(done.id);
            }
            WorkerOutcome::TimedOut => {
                rec.mark_failed(FailureCause::Timeout);
                tracing::warn!(task_id = %done.id, "Task timed out");
                self.settle(done.id, Err(FailureCause::Timeout));
                self.cascade_dependency_failure(done.id);
            }
            WorkerOutcome::Failure(message) => {
                if rec.retries_remaining > 0 && self.shutdown.is_none() {
                    let delay =
                        retry_delay(rec.retry_delay, self.config.retry_backoff, rec.attempts);
                    let due_wall = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| {
                            chrono::Duration::zero()
                        });
                    rec.schedule_retry(
                        FailureCause::Execution {
                            message: message.clone(),
                        },
                        due_wall,
                    );
                    tracing::warn!(
                        task_id = %done.id,
                        attempt = rec.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Task failed: {message}; retry scheduled"
                    );
                    self.retries.push(Reverse((Instant::now() + delay, done.id)));
                } else {
                    rec.mark_failed(FailureCause::Execution {
                        message: message.clone(),
                    });
                    tracing::warn!(task_id = %done.id, "Task failed permanently: {message}");
                    self.settle(done.id, Err(FailureCause::Execution { message }));
                    self.cascade_dependency_failure(done.id);
                }
            }
        }
    }

    fn on_retries_due(&mut self) {
        let now = Instant::now();
        while let Some(&Reverse((due, id))) = self.retries.peek() {
            if due > now {
                break;
            }
            self.retries.pop();
            let Some(rec) = self.records.get_mut(&id) else {
                continue;
            };
            // Cancelled while the retry was pending.
            if rec.status != TaskStatus::Failed || rec.next_retry_at.is_none() {
                continue;
            }
            rec.requeue_for_retry();
            self.retried_total += 1;
            tracing::debug!(task_id = %id, remaining = rec.retries_remaining, "Task requeued for retry");
            self.push_ready(id);
        }
    }

    fn cancel(&mut self, id: Uuid) -> Option<bool> {
        let rec = self.records.get_mut(&id)?;
        match rec.status {
            TaskStatus::Pending | TaskStatus::Ready => {
                rec.mark_cancelled();
                tracing::info!(task_id = %id, "Task cancelled");
                self.settle(id, Err(FailureCause::Cancelled));
                self.cascade_dependency_failure(id);
                Some(true)
            }
            TaskStatus::Running => {
                // Cooperative: the worker observes the token and reports back.
                rec.cancel.cancel();
                tracing::info!(task_id = %id, "Cancellation requested for running task");
                Some(true)
            }
            TaskStatus::Failed if rec.next_retry_at.is_some() => {
                rec.mark_cancelled();
                tracing::info!(task_id = %id, "Pending retry cancelled");
                self.settle(id, Err(FailureCause::Cancelled));
                self.cascade_dependency_failure(id);
                Some(true)
            }
            _ => Some(false),
        }
    }

    /// Terminally fail a not-yet-running task and cascade to dependents.
    fn fail_task(&mut self, id: Uuid, cause: FailureCause) {
        let Some(rec) = self.records.get_mut(&id) else {
            return;
        };
        if rec.is_settled() || rec.status == TaskStatus::Running {
            return;
        }
        rec.mark_failed(cause.clone());
        rec.next_retry_at = None;
        tracing::warn!(task_id = %id, cause = ?cause, "Task failed");
        self.settle(id, Err(cause));
        self.cascade_dependency_failure(id);
    }

    /// Dependents of a task that ended without completing are failed with
    /// a DependencyFailed cause, transitively, never silently dropped.
    fn cascade_dependency_failure(&mut self, failed_id: Uuid) {
        for child in self.graph.dependents(failed_id) {
            if let Some(rec) = self.records.get(&child)
                && rec.status == TaskStatus::Pending
            {
                self.fail_task(
                    child,
                    FailureCause::DependencyFailed {
                        dependency: failed_id,
                    },
                );
            }
        }
    }

    fn promote_dependents(&mut self, completed_id: Uuid) {
        for child in self.graph.dependents(completed_id) {
            let Some(rec) = self.records.get_mut(&child) else {
                continue;
            };
            if rec.status == TaskStatus::Pending && rec.dependencies.is_subset(&self.completed) {
                rec.mark_ready();
                tracing::debug!(task_id = %child, "Dependencies satisfied, task ready");
                self.push_ready(child);
            }
        }
    }

    fn settle(&mut self, id: Uuid, outcome: TaskOutcome) {
        self.live = self.live.saturating_sub(1);
        if let Some(waiters) = self.waiters.remove(&id) {
            for tx in waiters {
                let _ = tx.send(outcome.clone());
            }
        }
    }

    fn begin_shutdown(&mut self, grace: Option<Duration>, done: Option<oneshot::Sender<()>>) {
        if let Some(shutdown) = &mut self.shutdown {
            if let Some(tx) = done {
                shutdown.done.push(tx);
            }
            return;
        }

        tracing::info!(grace = ?grace, in_flight = self.workers_busy, "Queue stopping");

        // Everything not yet running is cancelled; in-flight work drains.
        let to_cancel: Vec<Uuid> = self
            .records
            .iter()
            .filter(|(_, r)| {
                matches!(r.status, TaskStatus::Pending | TaskStatus::Ready)
                    || (r.status == TaskStatus::Failed && r.next_retry_at.is_some())
            })
            .map(|(id, _)| *id)
            .collect();
        for id in to_cancel {
            if let Some(rec) = self.records.get_mut(&id)
                && !rec.is_settled()
            {
                rec.mark_cancelled();
                self.settle(id, Err(FailureCause::Cancelled));
            }
        }
        self.ready.clear();
        self.retries.clear();

        self.shutdown = Some(ShutdownState {
            done: done.into_iter().collect(),
            deadline: grace.map(|g| Instant::now() + g),
            stragglers_cancelled: false,
        });
    }

    fn on_grace_expired(&mut self) {
        let Some(shutdown) = &mut self.shutdown else {
            return;
        };
        shutdown.stragglers_cancelled = true;
        tracing::warn!(
            in_flight = self.workers_busy,
            "Shutdown grace expired, cancelling in-flight tasks"
        );
        for rec in self.records.values() {
            if rec.status == TaskStatus::Running {
                rec.cancel.cancel();
            }
        }
    }

    fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            depth: self.live,
            pending: 0,
            ready: 0,
            running: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            workers_busy: self.workers_busy,
            max_workers: self.config.max_workers,
            submitted_total: self.submitted_total,
            retried_total: self.retried_total,
            resources: self.pool.utilization(),
        };
        for rec in self.records.values() {
            match rec.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }
        stats
    }
}

fn outcome_of(rec: &TaskRecord) -> TaskOutcome {
    match rec.status {
        TaskStatus::Completed => Ok(rec.result.clone().unwrap_or(Value::Null)),
        _ => Err(rec.failure.clone().unwrap_or(FailureCause::Execution {
            message: "task ended without a recorded cause".to_string(),
        })),
    }
}

/// Base delay with multiplicative backoff per attempt and a little jitter
/// to keep retrying tasks from thundering in lockstep.
fn retry_delay(base: Duration, backoff: f64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let factor = backoff.max(1.0).powi(exponent);
    let jitter = rand::thread_rng().gen_range(0.9..=1.1);
    base.mul_f64(factor * jitter)
}

async fn execute_task(
    invocation: Invocation,
    ctx: TaskContext,
    timeout: Option<Duration>,
    cancel: CancellationToken,
) -> WorkerOutcome {
    let work = invocation.execute(ctx);
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                return WorkerOutcome::TimedOut;
            }
        },
        None => work.await,
    };

    // A cancelled task's return value is discarded even if the unit ran to
    // the end; the cancel request wins.
    if cancel.is_cancelled() {
        return WorkerOutcome::Cancelled;
    }
    match result {
        Ok(value) => WorkerOutcome::Success(value),
        Err(error) => WorkerOutcome::Failure(format!("{error:#}")),
    }
}

async fn recv_command(rx: &mut mpsc::Receiver<Command>, closed: bool) -> Option<Command> {
    if closed {
        std::future::pending::<()>().await;
    }
    rx.recv().await
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
