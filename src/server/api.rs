//! Cluster operations over HTTP
//!
//! - `POST /clusters` - Create a cluster in the background (202)
//! - `DELETE /clusters/{name}` - Destroy a cluster in the background (202)
//! - `PUT /active` - Switch the active cluster
//! - `POST /refresh` - Reconcile now
//!
//! Configured hook scripts run after create and destroy.

use super::health::{AppState, ClustersResponse};
use crate::chart::Chart;
use crate::cluster::{generate_cluster_name, split_server_args, ClusterError, ClusterSpec};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

fn yes() -> bool {
    true
}

/// Body of `POST /clusters`; every field is optional
#[derive(Debug, Deserialize)]
pub struct CreateRequest {
    /// Random `k3s-cluster-N` when missing
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub workers: i32,
    /// `name:port`, or empty for the default registry
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub cache_hub: bool,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub api_address: Option<String>,
    /// Whitespace-separated k3s server flags
    #[serde(default)]
    pub server_args: Option<String>,
    #[serde(default)]
    pub dashboard: bool,
    #[serde(default = "yes")]
    pub activate: bool,
}

impl CreateRequest {
    pub fn into_spec(self) -> Result<ClusterSpec, ClusterError> {
        let name = self
            .name
            .filter(|n| !n.is_empty())
            .unwrap_or_else(generate_cluster_name);

        let mut spec = ClusterSpec::new(name);
        if let Some(registry) = self.registry {
            spec = spec.with_registry(&registry)?;
            spec.cache_hub = self.cache_hub;
        }
        if self.workers < 0 {
            return Err(ClusterError::InvalidNumWorkers(self.workers));
        }
        spec.num_workers = self.workers;
        spec.image = self.image.filter(|i| !i.is_empty());
        if let Some(address) = self.api_address {
            spec.api_address = address.parse()?;
        }
        if let Some(args) = self.server_args {
            spec.server_args = split_server_args(&args);
        }
        if self.dashboard {
            spec.charts.push(Chart::kubernetes_dashboard());
        }
        Ok(spec)
    }
}

#[derive(Debug, Deserialize)]
struct ActiveRequest {
    name: Option<String>,
}

fn rejected(e: ClusterError) -> Response {
    warn!(error = %e, "Rejected cluster request");
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": e.to_string() })),
    )
        .into_response()
}

async fn create_cluster(State(state): State<AppState>, Json(request): Json<CreateRequest>) -> Response {
    let activate = request.activate;
    let spec = match request.into_spec() {
        Ok(spec) => spec,
        Err(e) => return rejected(e),
    };
    let name = spec.name.clone();
    let hook = state.registry.context().settings.create_hook.clone();

    match state.registry.spawn_create(spec, activate, hook) {
        Ok(_task) => {
            info!(cluster = %name, "Cluster creation submitted");
            (StatusCode::ACCEPTED, Json(json!({ "name": name }))).into_response()
        }
        Err(e) => rejected(e),
    }
}

async fn destroy_cluster(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    if state.registry.get_cluster_by_name(&name).is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("unknown cluster {name}") })),
        )
            .into_response();
    }

    let hook = state.registry.context().settings.destroy_hook.clone();
    let _task = state.registry.spawn_destroy(name.clone(), hook);
    info!(cluster = %name, "Cluster destruction submitted");
    (StatusCode::ACCEPTED, Json(json!({ "name": name }))).into_response()
}

async fn set_active(State(state): State<AppState>, Json(request): Json<ActiveRequest>) -> Json<ClustersResponse> {
    state.registry.set_active(request.name.as_deref()).await;
    Json(ClustersResponse::from_registry(&state.registry))
}

async fn refresh(State(state): State<AppState>) -> Json<ClustersResponse> {
    state.registry.refresh(false, None).await;
    Json(ClustersResponse::from_registry(&state.registry))
}

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/clusters", post(create_cluster))
        .route("/clusters/{name}", delete(destroy_cluster))
        .route("/active", put(set_active))
        .route("/refresh", post(refresh))
}
