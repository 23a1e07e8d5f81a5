//! Group config endpoints: the peer-consumed `GET`/`POST /config` pair and
//! the operator's `/loadsharing/config` view.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::{config_hash, FailsafeMode, WireConfig};
use crate::error::Error;
use crate::services::config_sync;
use crate::state::AppState;

/// GET /config — the replicated config as peers consume it.
pub async fn get_shared_config(State(state): State<AppState>) -> impl IntoResponse {
    let members = state.members().await;
    let config = state.config.read().await;
    Json(WireConfig::from_local(&state.node.device_id, &config, &members))
}

/// POST /config — a peer pushes its config at us.
pub async fn receive_config(
    State(state): State<AppState>,
    Json(wire): Json<WireConfig>,
) -> impl IntoResponse {
    match config_sync::receive_pushed_config(&state, &wire).await {
        Ok(true) => (StatusCode::OK, Json(json!({"msg": "done"}))),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"msg": "local config is newer"})),
        ),
        Err(Error::InvalidInput(msg)) => {
            warn!("rejected pushed config from {}: {}", wire.device_id, msg);
            (StatusCode::BAD_REQUEST, Json(json!({"msg": msg})))
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"msg": e.to_string()})),
        ),
    }
}

/// GET /loadsharing/config — operator view, including node-local fields.
pub async fn get_group_config(State(state): State<AppState>) -> impl IntoResponse {
    let members = state.members().await;
    let config = state.config.read().await;
    let hash = config_hash(&config, &members);
    let mut body = match serde_json::to_value(&*config) {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"msg": e.to_string()})),
            );
        }
    };
    body["members"] = json!(members);
    body["config_hash"] = json!(hash);
    (StatusCode::OK, Json(body))
}

/// Operator-editable fields. `config_version` and `config_updated_at` are
/// read-only from the operator's side.
#[derive(Debug, Default, Deserialize)]
pub struct GroupConfigUpdate {
    pub enabled: Option<bool>,
    pub group_id: Option<String>,
    pub group_max_current_a: Option<f64>,
    pub safety_factor: Option<f64>,
    pub heartbeat_timeout_s: Option<u32>,
    pub failsafe_mode: Option<FailsafeMode>,
    pub failsafe_safe_current_a: Option<f64>,
    pub failsafe_peer_assumed_current_a: Option<f64>,
    pub min_charge_current_a: Option<f64>,
    pub per_node_max_current_a: Option<f64>,
    pub priority: Option<i32>,
}

impl GroupConfigUpdate {
    fn validate(&self) -> Result<(), String> {
        if let Some(ref group_id) = self.group_id {
            if group_id.trim().is_empty() {
                return Err("group_id cannot be empty".into());
            }
        }
        if let Some(value) = self.group_max_current_a {
            if !(value >= 0.0) {
                return Err("group_max_current_a must be >= 0".into());
            }
        }
        if let Some(value) = self.safety_factor {
            if !(0.0..=1.0).contains(&value) {
                return Err("safety_factor must be in [0,1]".into());
            }
        }
        if let Some(value) = self.heartbeat_timeout_s {
            if value < 5 {
                return Err("heartbeat_timeout_s must be >= 5".into());
            }
        }
        for (name, value) in [
            ("failsafe_safe_current_a", self.failsafe_safe_current_a),
            (
                "failsafe_peer_assumed_current_a",
                self.failsafe_peer_assumed_current_a,
            ),
            ("min_charge_current_a", self.min_charge_current_a),
            ("per_node_max_current_a", self.per_node_max_current_a),
        ] {
            if let Some(value) = value {
                if !(value >= 0.0) {
                    return Err(format!("{} must be >= 0", name));
                }
            }
        }
        Ok(())
    }
}

/// POST /loadsharing/config — operator mutation, bumps the version.
pub async fn update_group_config(
    State(state): State<AppState>,
    Json(update): Json<GroupConfigUpdate>,
) -> impl IntoResponse {
    if let Err(msg) = update.validate() {
        return (StatusCode::BAD_REQUEST, Json(json!({"msg": msg})));
    }

    let result = config_sync::mutate_local_config(&state, |config| {
        if let Some(enabled) = update.enabled {
            config.enabled = enabled;
        }
        if let Some(ref group_id) = update.group_id {
            config.group_id = group_id.clone();
        }
        if let Some(value) = update.group_max_current_a {
            config.group_max_current_a = value;
        }
        if let Some(value) = update.safety_factor {
            config.safety_factor = value;
        }
        if let Some(value) = update.heartbeat_timeout_s {
            config.heartbeat_timeout_s = value;
        }
        if let Some(mode) = update.failsafe_mode {
            config.failsafe_mode = mode;
        }
        if let Some(value) = update.failsafe_safe_current_a {
            config.failsafe_safe_current_a = value;
        }
        if let Some(value) = update.failsafe_peer_assumed_current_a {
            config.failsafe_peer_assumed_current_a = value;
        }
        if let Some(value) = update.min_charge_current_a {
            config.min_charge_current_a = value;
        }
        if let Some(value) = update.per_node_max_current_a {
            config.per_node_max_current_a = Some(value);
        }
        if let Some(priority) = update.priority {
            config.priority = priority;
        }
    })
    .await;

    match result {
        Ok(updated) => (
            StatusCode::OK,
            Json(json!({"msg": "done", "config_version": updated.config_version})),
        ),
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
