//! Routes and request handlers.
//!
//! - `GET /api/status` reports worker availability and counters.
//! - `POST /api/echo?delay_ms=N` runs a job on the pool that optionally sleeps
//!   for `N` ms, then returns the request body unchanged.
//!
//! Both routes sit behind the rate limit middleware. Unmatched paths get a
//! JSON 404 and are not counted against the client.

use super::{error::ApiError, middleware::rate_limit};
use crate::server::telemetry::{
    decrement_jobs_inflight, increment_job_errors, increment_jobs_inflight, record_job_duration,
};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use core::time::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sluice::{Admission, WorkerId, WorkerStats};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

/// Longest simulated work an echo request may ask for.
pub const MAX_ECHO_DELAY: Duration = Duration::from_secs(10);

/// State shared by every handler.
#[derive(Clone, Debug)]
pub struct AppState {
    admission: Admission,
    mock_remote_addr: Option<Arc<str>>,
    jobs_inflight: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(admission: Admission) -> Self {
        Self {
            admission,
            mock_remote_addr: None,
            jobs_inflight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Rate limit every request under `addr` instead of its real origin.
    #[must_use]
    pub fn with_mock_remote_addr(mut self, addr: Option<String>) -> Self {
        self.mock_remote_addr = addr.map(Arc::from);
        self
    }

    pub const fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn mock_remote_addr(&self) -> Option<&str> {
        self.mock_remote_addr.as_deref()
    }

    /// Echo jobs handed to the pool whose request has not finished.
    pub fn jobs_inflight(&self) -> usize {
        self.jobs_inflight.load(Ordering::Relaxed)
    }
}

/// Counts a job as in flight until dropped, including when the request
/// future is dropped on client disconnect.
struct InflightJob(Arc<AtomicUsize>);

impl InflightJob {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        increment_jobs_inflight();
        Self(Arc::clone(counter))
    }
}

impl Drop for InflightJob {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
        decrement_jobs_inflight();
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/echo", post(echo))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .fallback(not_found)
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Availability per worker id.
    pub workers: BTreeMap<WorkerId, bool>,
    pub stats: Vec<WorkerStats>,
    pub jobs_inflight: usize,
    pub shutting_down: bool,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let pool = state.admission().pool();
    Json(StatusResponse {
        workers: pool.status(),
        stats: pool.stats(),
        jobs_inflight: state.jobs_inflight(),
        shutting_down: pool.is_shutting_down(),
    })
}

#[derive(Debug, Deserialize)]
pub struct EchoParams {
    pub delay_ms: Option<u64>,
}

#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
async fn echo(
    State(state): State<AppState>,
    Query(params): Query<EchoParams>,
    body: Bytes,
) -> Result<Bytes, ApiError> {
    let delay = Duration::from_millis(params.delay_ms.unwrap_or(0));
    if delay > MAX_ECHO_DELAY {
        return Err(ApiError::bad_request(format!(
            "delay_ms must not exceed {}",
            MAX_ECHO_DELAY.as_millis()
        )));
    }

    let start = Instant::now();
    let inflight = InflightJob::start(&state.jobs_inflight);

    let result = state
        .admission()
        .execute(move || {
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            body
        })
        .await;

    drop(inflight);

    match result {
        Ok(body) => {
            record_job_duration(start.elapsed().as_secs_f64() * 1_000.0);
            Ok(body)
        }
        Err(err) => {
            increment_job_errors();
            #[cfg(feature = "tracing")]
            tracing::warn!("Echo job failed: {err}");
            Err(err.into())
        }
    }
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "Page Not found" })),
    )
}
