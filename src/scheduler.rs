//! Time-based task scheduler.
//!
//! Activates deferred and recurring work by submitting it into a
//! [`TaskQueue`](crate::queue::TaskQueue) at due times; owns no execution
//! logic itself. The ticking loop polls at a bounded resolution and wakes
//! immediately on schedule changes, the same shape as a cron ticker.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Error, Result, ScheduleError};
use crate::queue::TaskQueue;
use crate::task::spec::TaskSpec;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// State of one schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    /// Waiting for its next fire time.
    Armed,
    /// One-shot fired, max_runs reached, or the expression is exhausted.
    Completed,
    /// Cancelled before completing.
    Cancelled,
}

/// Public snapshot of an active schedule.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleInfo {
    pub id: Uuid,
    pub state: ScheduleState,
    pub kind: String,
    pub next_fire: Option<DateTime<Utc>>,
    pub run_count: u32,
}

#[derive(Debug)]
enum Trigger {
    Once,
    Every {
        interval: chrono::Duration,
        max_runs: Option<u32>,
    },
    Cron {
        schedule: cron::Schedule,
        expr: String,
    },
}

impl Trigger {
    fn kind(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Every { .. } => "every",
            Self::Cron { .. } => "cron",
        }
    }
}

struct ScheduleEntry {
    id: Uuid,
    spec: TaskSpec,
    trigger: Trigger,
    state: ScheduleState,
    next_fire: Option<DateTime<Utc>>,
    run_count: u32,
}

enum Command {
    Add {
        spec: TaskSpec,
        trigger: Trigger,
        first_fire: DateTime<Utc>,
        reply: oneshot::Sender<Uuid>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<Option<bool>>,
    },
    List {
        reply: oneshot::Sender<Vec<ScheduleInfo>>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Handle to a running scheduler.
#[derive(Clone)]
pub struct TaskScheduler {
    cmd_tx: mpsc::Sender<Command>,
}

impl TaskScheduler {
    /// Start a scheduler that submits due work into `queue`.
    pub fn start(config: SchedulerConfig, queue: TaskQueue) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        tracing::info!(tick = ?config.tick_interval, "Scheduler started");
        tokio::spawn(run(config, queue, cmd_rx));
        Self { cmd_tx }
    }

    /// Fire `spec` once at (or as soon as possible after) `when`.
    pub async fn schedule_at(&self, spec: TaskSpec, when: DateTime<Utc>) -> Result<Uuid> {
        validate_spec(&spec)?;
        self.add(spec, Trigger::Once, when).await
    }

    /// Fire `spec` repeatedly every `interval`, stopping after `max_runs`
    /// fires (when given) or on cancel. The first fire is one interval
    /// from now; later fire times chain from the original due time, so
    /// intervals do not drift.
    pub async fn schedule_every(
        &self,
        spec: TaskSpec,
        interval: Duration,
        max_runs: Option<u32>,
    ) -> Result<Uuid> {
        validate_spec(&spec)?;
        if interval.is_zero() {
            return Err(ScheduleError::Validation {
                reason: "interval must be non-zero".to_string(),
            }
            .into());
        }
        let interval = chrono::Duration::from_std(interval).map_err(|e| {
            Error::from(ScheduleError::Validation {
                reason: format!("interval out of range: {e}"),
            })
        })?;
        let first = Utc::now() + interval;
        self.add(spec, Trigger::Every { interval, max_runs }, first).await
    }

    /// Fire `spec` at each match of a cron expression, until cancelled.
    pub async fn schedule_cron(&self, spec: TaskSpec, expr: &str) -> Result<Uuid> {
        validate_spec(&spec)?;
        let schedule = cron::Schedule::from_str(expr).map_err(|e| {
            Error::from(ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: e.to_string(),
            })
        })?;
        let Some(first) = schedule.upcoming(Utc).next() else {
            return Err(ScheduleError::InvalidCron {
                expr: expr.to_string(),
                reason: "expression never fires".to_string(),
            }
            .into());
        };
        let trigger = Trigger::Cron {
            schedule,
            expr: expr.to_string(),
        };
        self.add(spec, trigger, first).await
    }

    /// Cancel a schedule. Returns false when it already completed or was
    /// cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Cancel { id, reply: tx }).await?;
        rx.await
            .map_err(|_| Error::from(ScheduleError::ShuttingDown))?
            .ok_or_else(|| ScheduleError::NotFound { id }.into())
    }

    /// All armed schedules with their next fire time and run count.
    pub async fn list(&self) -> Result<Vec<ScheduleInfo>> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::List { reply: tx }).await?;
        rx.await.map_err(|_| ScheduleError::ShuttingDown.into())
    }

    /// Stop the ticking loop. Armed schedules are dropped.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop { done: tx }).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn add(&self, spec: TaskSpec, trigger: Trigger, first_fire: DateTime<Utc>) -> Result<Uuid> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Add {
            spec,
            trigger,
            first_fire,
            reply: tx,
        })
        .await?;
        rx.await.map_err(|_| ScheduleError::ShuttingDown.into())
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| Error::from(ScheduleError::ShuttingDown))
    }
}

fn validate_spec(spec: &TaskSpec) -> Result<()> {
    // Each fire submits a fresh task, so a pinned task id cannot be honored.
    if spec.id.is_some() {
        return Err(ScheduleError::Validation {
            reason: "scheduled tasks are assigned a fresh id per fire".to_string(),
        }
        .into());
    }
    Ok(())
}

async fn run(config: SchedulerConfig, queue: TaskQueue, mut cmd_rx: mpsc::Receiver<Command>) {
    let mut entries: std::collections::HashMap<Uuid, ScheduleEntry> =
        std::collections::HashMap::new();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Add { spec, trigger, first_fire, reply }) => {
                    let id = Uuid::new_v4();
                    tracing::info!(
                        schedule_id = %id,
                        kind = trigger.kind(),
                        next_fire = %first_fire,
                        "Schedule armed"
                    );
                    entries.insert(id, ScheduleEntry {
                        id,
                        spec,
                        trigger,
                        state: ScheduleState::Armed,
                        next_fire: Some(first_fire),
                        run_count: 0,
                    });
                    let _ = reply.send(id);
                }
                Some(Command::Cancel { id, reply }) => {
                    let cancelled = entries.get_mut(&id).map(|entry| {
                        if entry.state == ScheduleState::Armed {
                            entry.state = ScheduleState::Cancelled;
                            entry.next_fire = None;
                            tracing::info!(schedule_id = %id, "Schedule cancelled");
                            true
                        } else {
                            false
                        }
                    });
                    let _ = reply.send(cancelled);
                }
                Some(Command::List { reply }) => {
                    let infos = entries
                        .values()
                        .filter(|e| e.state == ScheduleState::Armed)
                        .map(|e| ScheduleInfo {
                            id: e.id,
                            state: e.state,
                            kind: e.trigger.kind().to_string(),
                            next_fire: e.next_fire,
                            run_count: e.run_count,
                        })
                        .collect();
                    let _ = reply.send(infos);
                }
                Some(Command::Stop { done }) => {
                    tracing::info!("Scheduler stopping");
                    let _ = done.send(());
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep(config.tick_interval) => {
                tick(&queue, &mut entries).await;
            }
        }
    }
}

/// Fire every due schedule once. A schedule that missed several intervals
/// emits exactly one fire per check; the next fire time is fast-forwarded
/// from the original due time rather than from now.
async fn tick(queue: &TaskQueue, entries: &mut std::collections::HashMap<Uuid, ScheduleEntry>) {
    let now = Utc::now();
    for entry in entries.values_mut() {
        if entry.state != ScheduleState::Armed {
            continue;
        }
        let Some(due) = entry.next_fire else { continue };
        if due > now {
            continue;
        }

        let mut spec = entry.spec.clone();
        spec.id = None;
        match queue.submit(spec).await {
            Ok(task_id) => {
                entry.run_count += 1;
                tracing::info!(
                    schedule_id = %entry.id,
                    task_id = %task_id,
                    run = entry.run_count,
                    "Schedule fired"
                );
            }
            Err(e) => {
                // The fire still counts; the queue refused the work.
                entry.run_count += 1;
                tracing::warn!(schedule_id = %entry.id, error = %e, "Scheduled submission failed");
            }
        }

        advance(entry, due, now);
    }
}

fn advance(entry: &mut ScheduleEntry, fired_at: DateTime<Utc>, now: DateTime<Utc>) {
    match &entry.trigger {
        Trigger::Once => {
            entry.state = ScheduleState::Completed;
            entry.next_fire = None;
        }
        Trigger::Every { interval, max_runs } => {
            if max_runs.is_some_and(|max| entry.run_count >= max) {
                entry.state = ScheduleState::Completed;
                entry.next_fire = None;
                tracing::info!(schedule_id = %entry.id, runs = entry.run_count, "Schedule completed");
                return;
            }
            // Chain from the due time that just fired; skip missed
            // intervals without emitting a backlog.
            let mut next = fired_at + *interval;
            while next <= now {
                next = next + *interval;
            }
            entry.next_fire = Some(next);
        }
        Trigger::Cron { schedule, expr } => {
            entry.next_fire = schedule.after(&now).next();
            if entry.next_fire.is_none() {
                entry.state = ScheduleState::Completed;
                tracing::info!(schedule_id = %entry.id, expr = %expr, "Cron schedule exhausted");
            }
        }
    }
}
