//! Resource pool admission control.
//!
//! Finite named resources (compute share, memory share, concurrency slots)
//! allocated all-or-nothing per owner. Waiters are woken on release rather
//! than polling.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::ResourceError;

/// Utilization snapshot for one resource type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ResourceUsage {
    pub allocated: f64,
    pub capacity: f64,
}

#[derive(Debug, Default)]
struct PoolState {
    capacity: HashMap<String, f64>,
    allocated: HashMap<String, f64>,
    owners: HashMap<Uuid, Vec<(String, f64)>>,
}

/// Admission control over finite named resources.
///
/// The accounting sits behind a mutex with short, never-awaiting critical
/// sections, so the pool is usable both inside a scheduling loop and
/// standalone from concurrent callers.
#[derive(Debug)]
pub struct ResourcePool {
    state: Mutex<PoolState>,
    released: Notify,
}

impl ResourcePool {
    /// Create a pool with the given per-type capacities.
    pub fn new(capacity: HashMap<String, f64>) -> Self {
        let allocated = capacity.keys().map(|k| (k.clone(), 0.0)).collect();
        Self {
            state: Mutex::new(PoolState {
                capacity,
                allocated,
                owners: HashMap::new(),
            }),
            released: Notify::new(),
        }
    }

    /// Check that every requirement could be satisfied by an idle pool.
    ///
    /// Used to reject requests that would otherwise wait forever.
    pub fn can_ever_satisfy(&self, requirements: &[(String, f64)]) -> Result<(), ResourceError> {
        let state = self.state.lock().expect("resource pool mutex poisoned");
        for (resource, amount) in requirements {
            let Some(&capacity) = state.capacity.get(resource) else {
                return Err(ResourceError::Unknown {
                    resource: resource.clone(),
                });
            };
            if *amount > capacity {
                return Err(ResourceError::Unsatisfiable {
                    resource: resource.clone(),
                    amount: *amount,
                    capacity,
                });
            }
        }
        Ok(())
    }

    /// Atomically allocate every requirement for `owner`, or nothing.
    ///
    /// Returns false when any requirement does not fit right now (or names
    /// an unknown resource type). An owner holding an allocation already is
    /// a no-op success.
    pub fn try_allocate(&self, owner: Uuid, requirements: &[(String, f64)]) -> bool {
        if requirements.is_empty() {
            return true;
        }

        let mut state = self.state.lock().expect("resource pool mutex poisoned");
        let state = &mut *state;
        if state.owners.contains_key(&owner) {
            return true;
        }

        // Verify the whole request before touching the books.
        for (resource, amount) in requirements {
            match state.capacity.get(resource) {
                Some(&capacity) => {
                    let used = state.allocated.get(resource).copied().unwrap_or(0.0);
                    if used + amount > capacity {
                        return false;
                    }
                }
                None => {
                    tracing::warn!(owner = %owner, resource = %resource, "Unknown resource type in requirement");
                    return false;
                }
            }
        }

        for (resource, amount) in requirements {
            let used = state.allocated.entry(resource.clone()).or_insert(0.0);
            *used += amount;
            let capacity = state.capacity[resource];
            debug_assert!(
                *used <= capacity + f64::EPSILON,
                "allocation accounting overflow for '{resource}': {used} > {capacity}"
            );
        }
        state.owners.insert(owner, requirements.to_vec());

        tracing::trace!(owner = %owner, count = requirements.len(), "Resources allocated");
        true
    }

    /// Like [`ResourcePool::try_allocate`], but suspends until capacity
    /// frees. Errors immediately if the requirements could never fit.
    pub async fn allocate(
        &self,
        owner: Uuid,
        requirements: &[(String, f64)],
    ) -> Result<(), ResourceError> {
        self.can_ever_satisfy(requirements)?;
        loop {
            // Arm the notification before checking so a concurrent release
            // between the check and the await is not lost.
            let released = self.released.notified();
            if self.try_allocate(owner, requirements) {
                return Ok(());
            }
            released.await;
        }
    }

    /// Free every allocation tied to `owner`. Idempotent: releasing an
    /// owner that holds nothing is a no-op.
    pub fn release(&self, owner: Uuid) {
        let mut state = self.state.lock().expect("resource pool mutex poisoned");
        let Some(held) = state.owners.remove(&owner) else {
            return;
        };
        for (resource, amount) in held {
            if let Some(used) = state.allocated.get_mut(&resource) {
                *used -= amount;
                debug_assert!(
                    *used >= -f64::EPSILON,
                    "allocation accounting underflow for '{resource}': {used}"
                );
                if *used < 0.0 {
                    *used = 0.0;
                }
            }
        }
        drop(state);

        tracing::trace!(owner = %owner, "Resources released");
        self.released.notify_waiters();
    }

    /// Resolves after the next release. Callers re-check their condition
    /// in a loop.
    pub async fn wait_release(&self) {
        self.released.notified().await;
    }

    /// Per-type utilization for monitoring.
    pub fn utilization(&self) -> HashMap<String, ResourceUsage> {
        let state = self.state.lock().expect("resource pool mutex poisoned");
        state
            .capacity
            .iter()
            .map(|(resource, &capacity)| {
                let allocated = state.allocated.get(resource).copied().unwrap_or(0.0);
                (resource.clone(), ResourceUsage { allocated, capacity })
            })
            .collect()
    }
}
