#![doc = include_str!("../README.md")]

mod server;

use clap::Parser;
use server::config::{CliArgs, ServerConfig};
use server::service::handler::{AppState, routes};
use server::telemetry::init_telemetry;
use sluice::{Admission, RateLimiter, WorkerManager};
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry(&config.log)?;

    let shutdown_token = CancellationToken::new();
    let pool = Arc::new(
        WorkerManager::with_shutdown_token(config.pool_size, shutdown_token.child_token())?
            .with_shutdown_timeout(config.shutdown_timeout),
    );
    let limiter = RateLimiter::initialize(
        config.rate_limit,
        config.rate_limit_window,
        shutdown_token.child_token(),
    )?;

    let admission = Admission::new(Arc::clone(&pool), limiter)
        .with_dispatch_timeout(config.dispatch_timeout)
        .with_completion_timeout(config.job_timeout);
    let state = AppState::new(admission).with_mock_remote_addr(config.mock_remote_addr.clone());

    let listener = TcpListener::bind(&config.server_addr).await?;
    log_startup_info(&config);

    let served = axum::serve(
        listener,
        routes(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    // In-flight requests have drained; stop the background work next.
    shutdown_token.cancel();
    if let Err(_e) = pool.shutdown().await {
        #[cfg(feature = "tracing")]
        tracing::error!("Error during worker pool shutdown: {:?}", _e);
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Service shut down successfully");

    providers.shutdown();
    served?;
    Ok(())
}

fn log_startup_info(_config: &ServerConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting sluice on {} with full config: {:#?}",
            _config.server_addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting sluice on {} with {} workers, {} requests per {:?}",
            _config.server_addr,
            _config.pool_size,
            _config.rate_limit,
            _config.rate_limit_window
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, terminating gracefully...");
}
