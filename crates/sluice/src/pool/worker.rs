use crate::error::{Error, Result};
use core::{any::Any, fmt};
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
};
use tokio::sync::{Notify, mpsc, oneshot};

/// An opaque, zero-argument unit of work.
///
/// Jobs carry their own completion signalling; the pool never reports when a
/// job has finished.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Messages understood by a worker's execution loop.
pub(crate) enum WorkRequest {
    /// Execute the job to completion on the worker thread.
    Run(Job),
    /// Stop the loop and acknowledge through `response`.
    Shutdown { response: oneshot::Sender<()> },
}

/// Stable identifier of a worker, unique within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize), serde(transparent))]
pub struct WorkerId(usize);

impl WorkerId {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn get(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Point-in-time counters for a single worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct WorkerStats {
    pub id: WorkerId,
    pub available: bool,
    /// Jobs that ran to completion.
    pub completed: u64,
    /// Jobs that panicked and were contained at the worker boundary.
    pub faulted: u64,
}

struct WorkerState {
    #[cfg(feature = "cache-padded")]
    available: crossbeam_utils::CachePadded<AtomicBool>,
    #[cfg(not(feature = "cache-padded"))]
    available: AtomicBool,
    completed: AtomicU64,
    faulted: AtomicU64,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            #[cfg(feature = "cache-padded")]
            available: crossbeam_utils::CachePadded::new(AtomicBool::new(true)),
            #[cfg(not(feature = "cache-padded"))]
            available: AtomicBool::new(true),
            completed: AtomicU64::new(0),
            faulted: AtomicU64::new(0),
        }
    }
}

/// A single sequential executor with one job slot.
///
/// Each worker owns a dedicated OS thread and a bounded channel of capacity
/// one. The thread waits for a job, marks the worker unavailable, runs the job
/// to completion, marks the worker available again and loops. A panicking job
/// is contained with [`catch_unwind`](std::panic::catch_unwind) so it can never
/// take the worker down with it.
///
/// The loop stops when it receives a shutdown request or when every handle to
/// the worker has been dropped.
pub struct Worker {
    id: WorkerId,
    tx: mpsc::Sender<WorkRequest>,
    state: Arc<WorkerState>,
}

impl Worker {
    /// Creates a worker and starts its execution thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if the OS refuses to create the thread.
    pub fn spawn(id: WorkerId) -> Result<Self> {
        Self::spawn_with_notify(id, Arc::new(Notify::new()))
    }

    /// Like [`Worker::spawn`], but signals `freed` every time the worker
    /// becomes available again.
    pub(crate) fn spawn_with_notify(id: WorkerId, freed: Arc<Notify>) -> Result<Self> {
        // A single slot: at most one submission waits while nothing else is
        // buffered behind the running job.
        let (tx, rx) = mpsc::channel(1);
        let state = Arc::new(WorkerState::new());
        let loop_state = Arc::clone(&state);

        thread::Builder::new()
            .name(format!("sluice-worker-{id}"))
            .spawn(move || worker_loop(id, rx, loop_state, freed))
            .map_err(|e| Error::WorkerSpawn {
                worker_id: id.get(),
                context: e.to_string(),
            })?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {id} spawned");

        Ok(Self { id, tx, state })
    }

    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the advisory availability flag.
    ///
    /// The value carries no ordering guarantee relative to a concurrent
    /// [`Worker::submit`]; the manager claims workers through a separate
    /// reservation step.
    pub fn is_available(&self) -> bool {
        self.state.available.load(Ordering::Acquire)
    }

    /// Hands a job to this specific worker.
    ///
    /// Waits until the worker's slot accepts the job. Returns once the job is
    /// queued, not once it has run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelError`] if the worker has stopped.
    pub async fn submit<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx
            .send(WorkRequest::Run(Box::new(job)))
            .await
            .map_err(|_| self.closed())
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            available: self.is_available(),
            completed: self.state.completed.load(Ordering::Relaxed),
            faulted: self.state.faulted.load(Ordering::Relaxed),
        }
    }

    /// Atomically claims an idle worker for the caller.
    ///
    /// At most one concurrent caller wins for any given idle period.
    pub(crate) fn try_reserve(&self) -> bool {
        self.state
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Sends a job to a worker previously claimed with [`Worker::try_reserve`].
    ///
    /// The slot of a reserved worker is empty, so the fast path never awaits.
    pub(crate) async fn submit_reserved(&self, job: Job) -> Result<()> {
        match self.tx.try_send(WorkRequest::Run(job)) {
            Ok(()) => Ok(()),
            // Only reachable when someone bypassed the manager with `submit`.
            Err(mpsc::error::TrySendError::Full(request)) => {
                self.tx.send(request).await.map_err(|_| self.closed())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed()),
        }
    }

    /// Queues a shutdown request behind any in-flight job.
    pub(crate) async fn request_shutdown(&self) -> Result<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WorkRequest::Shutdown { response: tx })
            .await
            .map_err(|_| self.closed())?;
        Ok(rx)
    }

    fn closed(&self) -> Error {
        Error::ChannelError {
            context: format!("Worker {} channel closed", self.id),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("available", &self.is_available())
            .finish()
    }
}

fn worker_loop(
    _worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkRequest>,
    state: Arc<WorkerState>,
    freed: Arc<Notify>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} started");

    while let Some(request) = rx.blocking_recv() {
        match request {
            WorkRequest::Run(job) => {
                state.available.store(false, Ordering::Release);

                match panic::catch_unwind(AssertUnwindSafe(job)) {
                    Ok(()) => {
                        state.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_payload) => {
                        state.faulted.fetch_add(1, Ordering::Relaxed);
                        #[cfg(feature = "tracing")]
                        tracing::error!(
                            "Worker {_worker_id} recovered from a faulted job: {}",
                            panic_message(&*_payload)
                        );
                    }
                }

                state.available.store(true, Ordering::Release);
                freed.notify_waiters();
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {_worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {_worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    // A stopped worker must never be reserved again.
    state.available.store(false, Ordering::Release);

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {_worker_id} stopped");
}

#[cfg_attr(not(feature = "tracing"), allow(dead_code))]
fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
