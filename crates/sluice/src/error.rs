//! Error types for the admission and execution core.
//!
//! This module defines the central [`Error`] enum, which captures every
//! recoverable and reportable failure of the worker pool, the rate limiter and
//! the admission adapter built on top of them.
//!
//! ## Error Cases
//! - `InvalidConfig`: A pool size, limit or window was rejected at
//!   construction time.
//! - `WorkerSpawn`: The OS refused to start a worker thread.
//! - `ChannelError`: A worker's job channel is closed.
//! - `DispatchTimeout`: No worker accepted the job before the caller's
//!   deadline.
//! - `JobTimeout`: The job did not signal completion before the caller's
//!   deadline.
//! - `JobFaulted`: The job panicked before signalling completion.
//! - `RateLimited`: The client exceeded its request budget for the window.
//! - `ServiceShutdown`: Work arrived while the pool was shutting down.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the admission and execution core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A configuration value was missing, zero or otherwise unusable.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A worker thread could not be started.
    #[error("Failed to spawn worker {worker_id}: {context}")]
    WorkerSpawn { worker_id: usize, context: String },

    /// Internal channel send/receive failure (e.g., the worker has stopped).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// No worker became available before the dispatch deadline.
    #[error("No worker accepted the job within {timeout:?}")]
    DispatchTimeout { timeout: Duration },

    /// The job did not complete before the completion deadline.
    #[error("Job did not complete within {timeout:?}")]
    JobTimeout { timeout: Duration },

    /// The job panicked before it could report a result.
    #[error("Job faulted during execution")]
    JobFaulted,

    /// The client has exhausted its request budget for the current window.
    #[error("Too many requests from {key}")]
    RateLimited { key: String },

    /// The pool is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl Error {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}
