//! Queue introspection snapshot.

use std::collections::HashMap;

use serde::Serialize;

use crate::resources::ResourceUsage;

/// Point-in-time view of queue state, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Admitted tasks that have not settled yet.
    pub depth: usize,
    pub pending: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Worker slots currently executing a task.
    pub workers_busy: usize,
    pub max_workers: usize,
    pub submitted_total: u64,
    pub retried_total: u64,
    /// Per-type resource utilization.
    pub resources: HashMap<String, ResourceUsage>,
}

impl QueueStats {
    /// Fraction of worker slots in use, 0.0 to 1.0.
    pub fn worker_utilization(&self) -> f64 {
        if self.max_workers == 0 {
            return 0.0;
        }
        self.workers_busy as f64 / self.max_workers as f64
    }
}
