//! HTTP boundary in front of the worker pool.
//!
//! Every API request passes the rate limit middleware first; handlers that do
//! real work run it as a job on the pool and wait for the result.
//!
//! ## Structure
//!
//! - [`handler`] - Routes, shared state and request handlers.
//! - [`middleware`] - Client key extraction and rate limiting.
//! - [`error`] - Mapping of core errors onto JSON HTTP responses.

pub mod error;
pub mod handler;
pub mod middleware;
