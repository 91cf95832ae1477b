//! HTTP surface of the control plane
//!
//! Exposes the shard read model, the current snapshot serialization (consumed
//! by the registry publisher), reassignment and version switchover, the
//! master-promotion gate and the capacity drain.

use crate::drain::{DrainController, DrainRequest};
use crate::metrics::{MetricName, ShardMetricsManager};
use crate::shard::ShardManager;
use crate::validator::ConfigValidator;
use crate::Error;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ShardManager>,
    pub validator: Arc<ConfigValidator>,
    pub drain: Arc<DrainController>,
    pub metrics: Arc<ShardMetricsManager>,
}

/// Build the HTTP API router
pub fn build_http_router(state: ApiState) -> Router {
    use tower_http::cors::{Any, CorsLayer};

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/shards", get(list_shards))
        .route("/api/v1/shards/version", get(current_version))
        .route("/api/v1/shards/assign", post(assign_shards))
        .route("/api/v1/shards/exchange", post(exchange_version))
        .route(
            "/api/v1/groups/:group/master-readiness",
            get(master_readiness),
        )
        .route("/api/v1/groups/:group/drain", post(drain_group))
        .route("/api/v1/groups/:group/nodes/:node_id/status", get(node_status))
        .with_state(state)
        .layer(cors)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn list_shards(State(state): State<ApiState>) -> Response {
    Json(state.manager.get_shards()).into_response()
}

async fn current_version(State(state): State<ApiState>) -> Response {
    match state.manager.current_version_data() {
        // Exactly the bytes the store persists; registry publishers mirror
        // this without re-encoding.
        Ok(data) => ([(header::CONTENT_TYPE, "application/json")], data).into_response(),
        Err(e) => error_response(e),
    }
}

async fn assign_shards(State(state): State<ApiState>) -> Response {
    state.manager.assign_shards();
    match state.manager.store_shards().await {
        Ok(version) => Json(serde_json::json!({ "version": version })).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    version: String,
}

async fn exchange_version(
    State(state): State<ApiState>,
    Json(request): Json<ExchangeRequest>,
) -> Response {
    match state.manager.exchange_shards(&request.version).await {
        Ok(()) => Json(serde_json::json!({ "version": request.version })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn master_readiness(
    State(state): State<ApiState>,
    Path(group): Path<String>,
) -> Response {
    match state.validator.check_group_ready_to_be_master(&group) {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct DrainBody {
    reduce_rate: u32,
    reduce_mode: MetricName,
}

async fn drain_group(
    State(state): State<ApiState>,
    Path(group): Path<String>,
    Json(body): Json<DrainBody>,
) -> Response {
    let request = DrainRequest {
        group_name: group,
        keep_rate: body.reduce_rate,
        metric: body.reduce_mode,
    };
    match state.drain.reduce_metrics(&request).await {
        Ok(reports) => Json(reports).into_response(),
        Err(e) => error_response(e),
    }
}

async fn node_status(
    State(state): State<ApiState>,
    Path((group, node_id)): Path<(String, u32)>,
) -> Response {
    let is_available = state.metrics.is_node_available(&group, node_id);
    let read_kps = state
        .metrics
        .node_metric_value(&group, node_id, MetricName::ReadKpsMin1);
    let write_kps = state
        .metrics
        .node_metric_value(&group, node_id, MetricName::WriteKpsMin1);
    Json(serde_json::json!({
        "isAvailable": is_available,
        "readKps": read_kps as u64,
        "writeKps": write_kps as u64,
    }))
    .into_response()
}

fn error_response(error: Error) -> Response {
    let status = match &error {
        Error::ClusterNotFound
        | Error::GroupNotFound(_)
        | Error::VersionNotFound
        | Error::UnknownVersion(_) => StatusCode::NOT_FOUND,
        Error::Config(_)
        | Error::ClusterMismatch { .. }
        | Error::ShardTotalMismatch { .. } => StatusCode::BAD_REQUEST,
        Error::ActiveVersionConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}
