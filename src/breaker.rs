//! Circuit breaker for failure isolation.
//!
//! Wraps any external call site a work unit makes. State transitions and
//! the half-open trial slots are guarded by a mutex because, unlike the
//! queue internals, the breaker is consulted from arbitrary concurrent
//! callers.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::config::BreakerConfig;
use crate::error::BreakerError;

/// Predicate marking errors that pass through without being counted.
pub type ExclusionFilter = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// Breaker state name, exposed for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests pass through; failures are counted.
    Closed,
    /// Requests fail fast until the timeout elapses.
    Open,
    /// A bounded number of trial requests probe recovery.
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug)]
enum Inner {
    Closed { consecutive_failures: u32 },
    Open { opened_at: Instant },
    HalfOpen { trials_admitted: u32 },
}

/// Failure-detection state machine protecting a call site.
pub struct CircuitBreaker {
    config: BreakerConfig,
    exclude: Option<ExclusionFilter>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            exclude: None,
            inner: Mutex::new(Inner::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Errors matching `filter` are re-raised transparently and never
    /// counted toward the failure threshold.
    pub fn with_exclusion_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.exclude = Some(Arc::new(filter));
        self
    }

    /// Current state name.
    pub fn state(&self) -> BreakerState {
        match *self.inner.lock().expect("breaker mutex poisoned") {
            Inner::Closed { .. } => BreakerState::Closed,
            Inner::Open { .. } => BreakerState::Open,
            Inner::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// May a request proceed right now?
    ///
    /// While half-open, admits up to `half_open_max_calls` concurrent
    /// trials; extras are rejected as if the breaker were open. An open
    /// breaker whose timeout has elapsed transitions to half-open here and
    /// admits the caller as the first trial.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut *inner {
            Inner::Closed { .. } => true,
            Inner::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.timeout {
                    tracing::info!("Circuit breaker half-open, admitting trial requests");
                    *inner = Inner::HalfOpen { trials_admitted: 1 };
                    true
                } else {
                    false
                }
            }
            Inner::HalfOpen { trials_admitted } => {
                if *trials_admitted < self.config.half_open_max_calls {
                    *trials_admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. A single half-open trial success closes
    /// the breaker.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures = 0;
            }
            Inner::HalfOpen { .. } => {
                tracing::info!("Circuit breaker closed after successful trial");
                *inner = Inner::Closed {
                    consecutive_failures: 0,
                };
            }
            // A success reported while open (a call that straddled the
            // trip) does not close the breaker.
            Inner::Open { .. } => {}
        }
    }

    /// Record a failed call. Excluded errors are never counted.
    pub fn record_failure(&self, error: &anyhow::Error) {
        if let Some(filter) = &self.exclude
            && filter(error)
        {
            return;
        }

        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match &mut *inner {
            Inner::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = *consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened"
                    );
                    *inner = Inner::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            Inner::HalfOpen { .. } => {
                tracing::warn!("Circuit breaker re-opened after failed trial");
                *inner = Inner::Open {
                    opened_at: Instant::now(),
                };
            }
            Inner::Open { .. } => {}
        }
    }

    /// Run `fut` under the breaker.
    ///
    /// Rejected calls fail fast with [`BreakerError::Open`] (wrapped in
    /// `anyhow::Error`, downcastable). Excluded errors pass through without
    /// affecting the breaker. The breaker never retries; retry policy stays
    /// the caller's responsibility above it.
    pub async fn call<T, Fut>(&self, fut: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if !self.allow_request() {
            return Err(anyhow::Error::new(BreakerError::Open));
        }
        match fut.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure(&error);
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}
