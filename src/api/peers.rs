//! Peer management endpoints under `/loadsharing`.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::Error;
use crate::services::mdns::SNAPSHOT_TTL;
use crate::services::registry;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ListPeersParams {
    #[serde(default = "default_true")]
    pub include_discovered: bool,
    #[serde(default = "default_true")]
    pub include_configured: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ListPeersParams {
    fn default() -> Self {
        Self {
            include_discovered: true,
            include_configured: true,
        }
    }
}

/// GET /loadsharing/peers
/// Unified list of joined members and discovered neighbors.
pub async fn list_peers(
    State(state): State<AppState>,
    params: Option<Query<ListPeersParams>>,
) -> impl IntoResponse {
    let Query(params) = params.unwrap_or_default();
    Json(
        registry::unified_peers(&state, params.include_discovered, params.include_configured)
            .await,
    )
}

/// POST /loadsharing/peers
pub async fn add_peer(
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let host = match payload.get("host").and_then(Value::as_str) {
        Some(host) => host.trim().to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"msg": "Missing required 'host' parameter"})),
            );
        }
    };
    if host.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"msg": "Host cannot be empty"})),
        );
    }

    match registry::add_peer(&state, &host).await {
        Ok(()) => (StatusCode::OK, Json(json!({"msg": "done"}))),
        Err(Error::InvalidInput(msg)) => (StatusCode::BAD_REQUEST, Json(json!({"msg": msg}))),
        // The membership change took effect in memory; tell the operator
        // it will not survive a restart.
        Err(Error::Persist(msg)) => (
            StatusCode::OK,
            Json(json!({"msg": "done", "warning": format!("change not persisted: {}", msg)})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"msg": e.to_string()})),
        ),
    }
}

/// DELETE /loadsharing/peers/:host
pub async fn remove_peer(
    State(state): State<AppState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    match registry::remove_peer(&state, &host).await {
        Ok(()) => (StatusCode::OK, Json(json!({"msg": "done"}))),
        Err(Error::NotFound(msg)) => (StatusCode::NOT_FOUND, Json(json!({"msg": msg}))),
        Err(Error::Persist(msg)) => (
            StatusCode::OK,
            Json(json!({"msg": "done", "warning": format!("change not persisted: {}", msg)})),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"msg": e.to_string()})),
        ),
    }
}

/// POST /loadsharing/discover
/// Schedule a discovery query now. Idempotent and non-blocking.
pub async fn discover(State(state): State<AppState>) -> impl IntoResponse {
    state.discovery_trigger.notify_one();
    (StatusCode::OK, Json(json!({"msg": "done"})))
}

/// GET /loadsharing/discovery
/// Last completed discovery snapshot with worker statistics.
pub async fn discovery_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = match state.discovery.read() {
        Ok(snapshot) => snapshot,
        Err(_) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"msg": "discovery state unavailable"})),
            );
        }
    };

    (
        StatusCode::OK,
        Json(json!({
            "mdns_enabled": state.node.mdns_enabled,
            "peers": snapshot.peers,
            "count": snapshot.peers.len(),
            "fresh": snapshot.is_fresh(SNAPSHOT_TTL),
            "age_s": snapshot.completed_at.map(|t| t.elapsed().as_secs()),
            "discovery_count": snapshot.discovery_count,
            "last_result_count": snapshot.last_result_count,
            "query_in_progress": snapshot.query_in_progress,
        })),
    )
}
