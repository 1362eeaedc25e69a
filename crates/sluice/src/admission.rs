//! Boundary glue between inbound requests and the execution core.
//!
//! [`Admission`] couples a [`RateLimiter`] and a [`WorkerManager`]: it checks
//! the caller's client key, wraps the caller's closure as a [`Job`] that
//! reports its result over a one-shot channel, dispatches it and waits for the
//! result. The pool and limiter stay unaware of each other.
//!
//! [`Job`]: crate::Job

use crate::{
    error::{Error, Result},
    limiter::{Decision, RateLimiter},
    pool::WorkerManager,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{sync::oneshot, time::timeout};

/// Admission control in front of a worker pool.
///
/// Cheap to clone; clones share the same pool and limiter.
#[derive(Clone, Debug)]
pub struct Admission {
    pool: Arc<WorkerManager>,
    limiter: Arc<RateLimiter>,
    dispatch_timeout: Option<Duration>,
    completion_timeout: Option<Duration>,
}

impl Admission {
    pub const fn new(pool: Arc<WorkerManager>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            pool,
            limiter,
            dispatch_timeout: None,
            completion_timeout: None,
        }
    }

    /// Caps how long [`Admission::execute`] waits for a free worker.
    #[must_use]
    pub fn with_dispatch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    /// Caps how long [`Admission::execute`] waits for the job to finish once a
    /// worker has accepted it.
    #[must_use]
    pub fn with_completion_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.completion_timeout = timeout;
        self
    }

    pub const fn pool(&self) -> &Arc<WorkerManager> {
        &self.pool
    }

    pub const fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Records a request for `key` and checks it against the limit.
    ///
    /// Returns the post-increment count on success.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RateLimited`] once `key` is over the limit for the
    /// current window.
    pub fn check(&self, key: &str) -> Result<u64> {
        match self.limiter.admit(key) {
            Decision::Allowed { count } => Ok(count),
            Decision::Rejected { count: _count } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Rejected request {_count} from {key}");
                Err(Error::RateLimited {
                    key: key.to_owned(),
                })
            }
        }
    }

    /// Runs `f` on the pool and waits for its return value.
    ///
    /// # Errors
    ///
    /// - [`Error::DispatchTimeout`] if no worker accepted the job in time.
    /// - [`Error::JobTimeout`] if the job did not finish in time.
    /// - [`Error::JobFaulted`] if the job panicked.
    /// - [`Error::ServiceShutdown`] if the pool is shutting down.
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = move || {
            // A panic in `f` drops `tx`, which the receiver observes.
            let _ = tx.send(f());
        };

        match self.dispatch_timeout {
            Some(dispatch_timeout) => self.pool.dispatch_timeout(job, dispatch_timeout).await?,
            None => self.pool.dispatch(job).await?,
        }

        let outcome = match self.completion_timeout {
            Some(completion_timeout) => timeout(completion_timeout, rx).await.map_err(|_| {
                #[cfg(feature = "tracing")]
                tracing::warn!("Job did not complete within {completion_timeout:?}");
                Error::JobTimeout {
                    timeout: completion_timeout,
                }
            })?,
            None => rx.await,
        };

        outcome.map_err(|_| Error::JobFaulted)
    }

    /// [`Admission::check`] followed by [`Admission::execute`].
    ///
    /// # Errors
    ///
    /// Any error of either step.
    pub async fn run<F, T>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.check(key)?;
        self.execute(f).await
    }
}
