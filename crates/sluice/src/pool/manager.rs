//! Fixed-size pool of single-slot workers.
//!
//! This module defines the [`WorkerManager`] struct, which owns an ordered,
//! fixed-length set of [`Worker`]s and dispatches jobs to them. The pool never
//! grows or shrinks after construction and supports coordinated shutdown via a
//! shared [`CancellationToken`].
//!
//! Dispatch scans the workers in order and hands the job to the first one that
//! can be reserved, so under light load worker `0` takes most of the traffic.
//! When every worker is busy the caller parks until a worker signals that it
//! has become free, then scans again. No job is ever buffered beyond what a
//! worker can hold.

use super::worker::{Job, Worker, WorkerId, WorkerStats};
use crate::error::{Error, Result};
use core::time::Duration;
use std::{collections::BTreeMap, sync::Arc};
use tokio::{sync::Notify, time::timeout};
use tokio_util::sync::CancellationToken;

/// Default time to wait for each worker to acknowledge shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Owns a fixed set of [`Worker`]s and dispatches jobs to an available one.
pub struct WorkerManager {
    workers: Vec<Worker>,
    freed: Arc<Notify>,
    shutdown_token: CancellationToken,
    shutdown_timeout: Duration,
}

impl WorkerManager {
    /// Constructs and starts exactly `size` workers.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `size` is zero.
    /// - [`Error::WorkerSpawn`] if a worker thread cannot be started.
    pub fn new(size: usize) -> Result<Self> {
        Self::with_shutdown_token(size, CancellationToken::new())
    }

    /// Constructs the pool bound to an externally owned shutdown token.
    ///
    /// Cancelling the token makes every pending and future dispatch fail with
    /// [`Error::ServiceShutdown`].
    pub fn with_shutdown_token(size: usize, shutdown_token: CancellationToken) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_config("worker pool size must be greater than 0"));
        }

        let freed = Arc::new(Notify::new());
        let workers = (0..size)
            .map(|index| Worker::spawn_with_notify(WorkerId::new(index), Arc::clone(&freed)))
            .collect::<Result<Vec<_>>>()?;

        #[cfg(feature = "tracing")]
        tracing::info!("Started worker pool with {size} workers");

        Ok(Self {
            workers,
            freed,
            shutdown_token,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        })
    }

    /// Overrides the per-worker shutdown acknowledgement timeout.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Always `false`; a pool holds at least one worker.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown_token
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Hands `job` to the first available worker.
    ///
    /// Returns once a worker has accepted the job, not once the job has run.
    /// Waits without bound while every worker is busy; use
    /// [`WorkerManager::dispatch_timeout`] to cap the wait.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the pool is shutting down.
    /// - [`Error::ChannelError`] if the selected worker has stopped.
    pub async fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch_job(Box::new(job)).await
    }

    /// Like [`WorkerManager::dispatch`], but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DispatchTimeout`] when no worker accepted the job in
    /// time, in addition to the errors of [`WorkerManager::dispatch`].
    pub async fn dispatch_timeout<F>(&self, job: F, timeout_after: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match timeout(timeout_after, self.dispatch_job(Box::new(job))).await {
            Ok(result) => result,
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Dispatch timed out after {timeout_after:?}");
                Err(Error::DispatchTimeout {
                    timeout: timeout_after,
                })
            }
        }
    }

    async fn dispatch_job(&self, job: Job) -> Result<()> {
        loop {
            if self.shutdown_token.is_cancelled() {
                return Err(Error::ServiceShutdown);
            }

            // Register for the wake-up before scanning so a worker freed in
            // the middle of the scan is not missed.
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(worker) = self.reserve_first_available() {
                #[cfg(feature = "tracing")]
                tracing::trace!("Dispatching job to worker {}", worker.id());
                return worker.submit_reserved(job).await;
            }

            tokio::select! {
                () = freed.as_mut() => {}
                () = self.shutdown_token.cancelled() => return Err(Error::ServiceShutdown),
            }
        }
    }

    fn reserve_first_available(&self) -> Option<&Worker> {
        self.workers.iter().find(|worker| worker.try_reserve())
    }

    /// Returns a point-in-time availability snapshot keyed by worker id.
    ///
    /// Each flag is read independently, so under concurrent activity the
    /// entries are not guaranteed to be mutually consistent.
    pub fn status(&self) -> BTreeMap<WorkerId, bool> {
        self.workers
            .iter()
            .map(|worker| (worker.id(), worker.is_available()))
            .collect()
    }

    /// Returns per-worker counters in worker order.
    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(Worker::stats).collect()
    }

    /// Gracefully shuts down all workers in the pool.
    ///
    /// - Cancels the shared [`CancellationToken`] so parked and future
    ///   dispatches fail with [`Error::ServiceShutdown`].
    /// - Queues a shutdown request behind each worker's in-flight job.
    /// - Waits (up to the shutdown timeout per worker) for acknowledgements.
    ///
    /// Calling this more than once is harmless.
    pub async fn shutdown(&self) -> Result<()> {
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new jobs");
        self.shutdown_token.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!("Notifying all workers to shut down");
        let mut shutdown_handles = Vec::with_capacity(self.workers.len());

        for worker in &self.workers {
            match timeout(self.shutdown_timeout, worker.request_shutdown()).await {
                Ok(Ok(rx)) => shutdown_handles.push((worker.id(), rx)),
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Failed to send shutdown to worker {}: {_e}", worker.id());
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {} did not accept shutdown in time", worker.id());
                }
            }
        }

        let shutdown_timeout = self.shutdown_timeout;
        let acknowledgements = shutdown_handles.into_iter().map(|(_id, rx)| async move {
            match timeout(shutdown_timeout, rx).await {
                Ok(Ok(())) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {_id} shutdown acknowledged");
                }
                Ok(Err(_e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_id} returned error: {_e}");
                }
                Err(_) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {_id} shutdown timed out");
                }
            }
        });

        futures::future::join_all(acknowledgements).await;

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool shutdown complete");

        Ok(())
    }
}

impl core::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("workers", &self.workers)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
