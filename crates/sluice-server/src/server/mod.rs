//! Server-side components of `sluice-server`.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and startup validation.
//! - [`service`] - HTTP routes, the rate limit middleware and error mapping.
//! - [`telemetry`] - Console logging and optional OpenTelemetry export.

pub mod config;
pub mod service;
pub mod telemetry;
