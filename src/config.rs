//! Configuration types.

use std::collections::HashMap;
use std::time::Duration;

/// Task queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Number of concurrent worker slots.
    pub max_workers: usize,
    /// Maximum number of admitted, not-yet-settled tasks.
    pub max_queue_size: usize,
    /// Default per-task execution timeout (None = unbounded).
    pub default_timeout: Option<Duration>,
    /// Default number of retries for failed tasks.
    pub default_retry_count: u32,
    /// Default base delay before a retry.
    pub default_retry_delay: Duration,
    /// Multiplier applied to the retry delay on each subsequent attempt.
    pub retry_backoff: f64,
    /// Named resource capacities for admission control (empty = no resource gating).
    pub resource_capacity: HashMap<String, f64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_queue_size: 1024,
            default_timeout: None,
            default_retry_count: 0,
            default_retry_delay: Duration::from_secs(2),
            retry_backoff: 2.0,
            resource_capacity: HashMap::new(),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the scheduler checks for due schedules.
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive counted failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before admitting trial requests.
    pub timeout: Duration,
    /// Maximum concurrent trial requests while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}
