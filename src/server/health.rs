//! Local status endpoints
//!
//! - `/healthz` - Liveness: Is the process alive?
//! - `/readyz` - Readiness: Has the first reconciliation completed?
//! - `/metrics` - Prometheus text format
//! - `/clusters` - Known clusters and the active one, as JSON
//!
//! The mutating routes live in `api`.

use super::api;
use super::metrics::SharedMetrics;
use crate::cluster::ClusterSummary;
use crate::controller::ClusterRegistry;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state for readiness tracking
///
/// Set to ready once the initial reconciliation pass has run.
#[derive(Debug, Clone)]
pub struct ReadinessState {
    ready: Arc<AtomicBool>,
}

impl ReadinessState {
    /// Create a new readiness state (initially not ready)
    pub fn new() -> Self {
        Self {
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) readiness: ReadinessState,
    pub(super) metrics: SharedMetrics,
    pub(super) registry: Arc<ClusterRegistry>,
}

#[derive(Debug, Serialize)]
pub(super) struct ClustersResponse {
    active: Option<String>,
    clusters: Vec<ClusterSummary>,
}

impl ClustersResponse {
    pub(super) fn from_registry(registry: &ClusterRegistry) -> Self {
        Self {
            active: registry.active().map(|c| c.name().to_string()),
            clusters: registry.summaries(),
        }
    }
}

/// Always returns 200 OK - if this responds, the process is alive.
async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Returns 200 OK if ready, 503 Service Unavailable if not.
async fn readyz(State(state): State<AppState>) -> StatusCode {
    if state.readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn clusters(State(state): State<AppState>) -> Json<ClustersResponse> {
    Json(ClustersResponse::from_registry(&state.registry))
}

/// Run the status server on the specified port
///
/// Runs until the server is shut down or fails.
pub async fn run_health_server(
    port: u16,
    readiness: ReadinessState,
    metrics: SharedMetrics,
    registry: Arc<ClusterRegistry>,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(self::metrics))
        .route("/clusters", get(clusters))
        .merge(api::routes())
        .with_state(AppState {
            readiness,
            metrics,
            registry,
        });

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr).await?;
    // Log after successful bind - server is actually listening
    info!(port = %port, "Status server listening");

    axum::serve(listener, app)
        .await
        .map_err(std::io::Error::other)
}
