//! Local metadata lookup API
//!
//! Resolves aliases to monitored resources from the store, and exposes the
//! health checker and Prometheus metrics alongside.

use agent_lib::{health::HealthChecker, observability::AgentMetrics, store::MetadataStore};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<MetadataStore>,
    pub health: HealthChecker,
    pub metrics: AgentMetrics,
    pub verbose: bool,
}

impl AppState {
    pub fn new(store: Arc<MetadataStore>, health: HealthChecker, verbose: bool) -> Self {
        Self {
            store,
            health,
            metrics: AgentMetrics::new(),
            verbose,
        }
    }
}

/// Resolve an alias to the JSON form of its monitored resource.
async fn monitored_resource(
    State(state): State<Arc<AppState>>,
    Path(alias): Path<String>,
) -> impl IntoResponse {
    if state.verbose {
        debug!(alias = %alias, "Lookup request");
    }

    match state.store.lookup_resource(&alias).await {
        Ok(resource) => {
            state.metrics.inc_api_request("monitored_resource", 200);
            (StatusCode::OK, Json(resource)).into_response()
        }
        Err(_) => {
            state.metrics.inc_api_request("monitored_resource", 404);
            if state.verbose {
                debug!(alias = %alias, "No matching resource");
            }
            (
                StatusCode::NOT_FOUND,
                Json(json!({"status_code": 404, "error": "Not found"})),
            )
                .into_response()
        }
    }
}

/// Health check response - 200 while no updater reported a terminal
/// failure, 503 otherwise.
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.response().await;
    let status_code = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Unmatched paths and methods both get the JSON 404 body; the dispatch
/// surface is deliberately trivial, there is no 405.
async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"status_code": 404, "error": "Not found"})),
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/monitoredResource/{*alias}", get(monitored_resource))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .fallback(not_found)
        .method_not_allowed_fallback(not_found)
        .with_state(state)
}

/// Serve the API on an already-bound listener until the shutdown signal
/// fires; in-flight requests are drained before returning.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);
    info!(addr = ?listener.local_addr().ok(), "Starting metadata API server");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    info!("Metadata API server stopped");
    Ok(())
}
