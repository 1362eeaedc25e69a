//! Bounded worker pool.
//!
//! - [`Worker`] - a single sequential executor with one job slot and an
//!   availability flag, running on its own OS thread.
//! - [`WorkerManager`] - owns a fixed set of workers, dispatches jobs to the
//!   first available one and reports pool status.
//!
//! At no instant do more jobs run than there are workers, and every dispatched
//! job runs exactly once.

mod manager;
mod worker;

pub use manager::{DEFAULT_SHUTDOWN_TIMEOUT, WorkerManager};
pub use worker::{Job, Worker, WorkerId, WorkerStats};
