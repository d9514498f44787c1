//! Metadata agent daemon
//!
//! Discovers the host instance, locally running containers, and node-scoped
//! Kubernetes pods, and serves resource lookups to telemetry pipelines on
//! the same host.

use agent_lib::{
    config::AgentConfig,
    health::HealthChecker,
    store::MetadataStore,
    updater::{DockerPoller, InstancePoller, KubernetesPoller, PollingUpdater},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;

const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;

/// Grace window for draining in-flight API requests on shutdown.
const API_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn main() {
    let config = match AgentConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Invalid configuration: {e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let default_filter = if config.verbose_logging { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with(fmt::layer().json())
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.metadata_api_num_threads.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to build runtime");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(code);
}

async fn run(config: Arc<AgentConfig>) -> i32 {
    info!("Starting metadata agent");

    let health = HealthChecker::new();
    let mut store_builder = MetadataStore::builder().expire_after(config.store_expire_after());
    if let Some(interval) = config.store_expire_interval() {
        store_builder = store_builder.expire_interval(interval);
    }
    let store = Arc::new(store_builder.build());

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(4);

    let sweeper = if config.metadata_reporter_purge_deleted {
        Some(tokio::spawn(
            store.clone().run_sweeper(shutdown_tx.subscribe()),
        ))
    } else {
        None
    };

    let period = config.reporter_interval();
    let updaters = [
        PollingUpdater::new(
            Arc::new(InstancePoller::new(config.clone())),
            store.clone(),
            health.clone(),
            period,
        ),
        PollingUpdater::new(
            Arc::new(DockerPoller::new(config.clone())),
            store.clone(),
            health.clone(),
            period,
        ),
        PollingUpdater::new(
            Arc::new(KubernetesPoller::new(config.clone())),
            store.clone(),
            health.clone(),
            period,
        ),
    ];

    for updater in &updaters {
        if let Err(e) = updater.start().await {
            warn!(updater = updater.name(), error = %e, "Failed to start updater");
        } else {
            info!(
                updater = updater.name(),
                state = ?updater.state().await,
                "Updater started"
            );
        }
    }

    let bind_addr = config.api_bind_addr();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %bind_addr, error = %e, "Failed to bind API socket");
            return EXIT_BIND_FAILURE;
        }
    };

    let state = Arc::new(api::AppState::new(
        store.clone(),
        health.clone(),
        config.verbose_logging,
    ));
    let api_handle = tokio::spawn(api::serve(listener, state, shutdown_tx.subscribe()));

    shutdown_signal().await;
    info!("Shutting down");

    // Updaters first, so no new writes land while the API drains.
    for updater in &updaters {
        updater.stop().await;
    }

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(API_SHUTDOWN_GRACE, api_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => warn!(error = %e, "API server exited with error"),
        Ok(Err(e)) => warn!(error = %e, "API server task failed"),
        Err(_) => warn!("API server did not drain within the grace period"),
    }

    if let Some(sweeper) = sweeper {
        let _ = sweeper.await;
    }

    info!("Shutdown complete");
    0
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
