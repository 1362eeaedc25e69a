//! # Telemetry Features
//!
//! Console logging is installed unless `LOGGER_DISABLED` is set, and every
//! line can also be appended to `LOGGER_LOG_FILE`. `ERROR` events are copied
//! to `LOGGER_ERROR_LOG_FILE` when it is configured. File writes go through
//! `tracing-appender` worker threads, flushed by
//! [`TelemetryProviders::shutdown`]. OpenTelemetry export is opt-in.
//!
//! ## Feature matrix
//!
//! - `tracing`: Enables `tracing` events in the server and in the `sluice`
//!   core, plus OpenTelemetry distributed tracing (via spans).
//! - `metrics`: Enables OpenTelemetry metrics for admission and job execution.
//! - `stdout`: Enables the stdout exporter for spans and metrics.
//!
//! ## Feature constraints
//!
//! - The `stdout` exporter requires at least one of `tracing` or `metrics`.
//!
//! ## Metrics
//!
//! - `requests_admitted` / `requests_rejected`: rate limiter decisions.
//! - `jobs_inflight`: jobs handed to the pool and not yet finished.
//! - `job_errors`: jobs that faulted or timed out.
//! - `job_duration`: end-to-end time from dispatch to result, in ms.
//!
//! ## Example usage
//!
//! ```bash
//! cargo run --features tracing,metrics,stdout
//! ```

#[cfg(all(feature = "stdout", not(any(feature = "tracing", feature = "metrics"))))]
compile_error!(
    "The 'stdout' feature requires at least one of 'tracing' or 'metrics' to be enabled."
);

use super::config::LogConfig;
use anyhow::Context;
use std::{fs::OpenOptions, path::Path};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, filter::LevelFilter, layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "tracing"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "tracing")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "tracing")]
use opentelemetry_sdk::trace as sdktrace;

const SERVICE_NAME: &str = "sluice-server";

pub struct TelemetryProviders {
    log_guards: Vec<WorkerGuard>,
    #[cfg(feature = "tracing")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down every exporter. Errors are reported on stderr
    /// because the subscriber may already be gone.
    pub fn shutdown(self) {
        #[cfg(feature = "tracing")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }

        // Dropping the guards drains the file writers.
        drop(self.log_guards);
    }
}

pub fn init_telemetry(log: &LogConfig) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "tracing")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "tracing")]
    let tracer_provider = init_tracer();

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    #[cfg(any(feature = "metrics", feature = "tracing"))]
    let scope = InstrumentationScope::builder(SERVICE_NAME)
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    let (sinks, log_guards) = log_layers(log)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log.level.into()));

    let registry = tracing_subscriber::registry().with(sinks).with(filter);

    #[cfg(feature = "tracing")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.try_init()?;

    Ok(TelemetryProviders {
        log_guards,
        #[cfg(feature = "tracing")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

type LogLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Builds the console and file sinks selected by `log`.
///
/// The returned guards keep the file writers alive; log lines still queued
/// are written out when they are dropped.
fn log_layers(log: &LogConfig) -> anyhow::Result<(Vec<LogLayer>, Vec<WorkerGuard>)> {
    let mut layers = Vec::new();
    let mut guards = Vec::new();
    if log.disabled {
        return Ok((layers, guards));
    }

    // Human-readable console output, independent of any OpenTelemetry
    // exporter.
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_line_number(true)
            .with_target(false)
            .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
            .with_file(true)
            .pretty()
            .boxed(),
    );

    if let Some(path) = &log.file {
        let (writer, guard) = open_log_sink(path)?;
        guards.push(guard);
        layers.push(file_layer(writer).boxed());
    }

    if let Some(path) = &log.error_file {
        let (writer, guard) = open_log_sink(path)?;
        guards.push(guard);
        layers.push(
            file_layer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_filter(LevelFilter::ERROR)
                .boxed(),
        );
    }

    Ok((layers, guards))
}

fn open_log_sink(path: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(tracing_appender::non_blocking(file))
}

fn file_layer(
    writer: NonBlocking,
) -> tracing_subscriber::fmt::Layer<
    Registry,
    tracing_subscriber::fmt::format::DefaultFields,
    tracing_subscriber::fmt::format::Format<
        tracing_subscriber::fmt::format::Full,
        tracing_subscriber::fmt::time::ChronoLocal,
    >,
    NonBlocking,
> {
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
}

#[cfg(any(feature = "metrics", feature = "tracing"))]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name(SERVICE_NAME)
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

#[cfg(feature = "tracing")]
fn init_tracer() -> sdktrace::SdkTracerProvider {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    builder.build()
}

#[cfg(feature = "metrics")]
static REQUESTS_ADMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static REQUESTS_REJECTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOBS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static JOB_DURATION_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = REQUESTS_ADMITTED.set(
        meter
            .u64_counter("requests_admitted")
            .with_description("Requests that passed the rate limiter")
            .build(),
    );

    let _ = REQUESTS_REJECTED.set(
        meter
            .u64_counter("requests_rejected")
            .with_description("Requests refused by the rate limiter")
            .build(),
    );

    let _ = JOBS_INFLIGHT.set(
        meter
            .i64_up_down_counter("jobs_inflight")
            .with_description("Jobs dispatched to the pool and not yet finished")
            .build(),
    );

    let _ = JOB_ERRORS.set(
        meter
            .u64_counter("job_errors")
            .with_description("Jobs that faulted, timed out or were refused by the pool")
            .build(),
    );

    let _ = JOB_DURATION_MS.set(
        meter
            .f64_histogram("job_duration")
            .with_unit("ms")
            .with_description("Time from dispatch to job result")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_admitted() {
    if let Some(counter) = REQUESTS_ADMITTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_admitted() {}

#[cfg(feature = "metrics")]
pub fn increment_rejected() {
    if let Some(counter) = REQUESTS_REJECTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_rejected() {}

#[cfg(feature = "metrics")]
pub fn increment_jobs_inflight() {
    if let Some(counter) = JOBS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_jobs_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_jobs_inflight() {
    if let Some(counter) = JOBS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_jobs_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_job_errors() {
    if let Some(counter) = JOB_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_job_errors() {}

#[cfg(feature = "metrics")]
pub fn record_job_duration(duration_ms: f64) {
    if let Some(histogram) = JOB_DURATION_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_job_duration(_duration_ms: f64) {}
