//! # Siphon Scheduler
//!
//! The concurrent core of the daemon: a polling loop that drains `new` task
//! rows into per-link worker pools, a shared cancellation registry that
//! honors out-of-band cancellations between enqueue and dispatch, and the
//! pool/collector machinery that drives every task through
//! `new -> queued -> active -> {done, failed, cancelled}` with durable
//! database transitions.

mod pool;
mod registry;
mod scheduler;

// re-export
pub use pool::{LinkPool, COLLECT_INTERVAL};
pub use registry::CancelRegistry;
pub use scheduler::{Scheduler, SchedulerConfig};

use siphon_taskdb::TaskDbError;

#[derive(thiserror::Error, Debug)]
pub enum SchedError {
    #[error("task store error: {0}")]
    Store(#[from] TaskDbError),
}

pub type SchedResult<T> = Result<T, SchedError>;
