//! Task model.
//!
//! Core components:
//! - `invocation` — the opaque work-unit abstraction
//! - `record` — task status state machine and queue-side record
//! - `spec` — submission builder

pub mod invocation;
pub mod record;
pub mod spec;

pub use invocation::{Invocation, TaskContext, WorkUnit};
pub use record::{FailureCause, TaskRecord, TaskStatus};
pub use spec::TaskSpec;
