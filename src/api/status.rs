//! Status surfaces: the peer-consumed `/status` + `/ws` pair and the
//! operator's `/loadsharing/status` diagnostic object.

use std::sync::atomic::Ordering;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::models::EvseStatus;
use crate::state::AppState;

/// Current own status, synthesizing a fingerprint-only frame while the
/// charge controller has not reported yet.
async fn current_self_status(state: &AppState) -> EvseStatus {
    if let Some(status) = state.self_status.read().await.clone() {
        return status;
    }
    let (config_version, config_hash) = state.fingerprint().await;
    EvseStatus {
        id: Some(state.node.device_id.clone()),
        config_version,
        config_hash,
        ..Default::default()
    }
}

/// GET /status — consumed by sibling nodes for their bootstrap fetch.
pub async fn own_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(current_self_status(&state).await)
}

/// GET /ws — full snapshot on connect, then delta frames.
pub async fn ws_status(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_status_socket(socket, state))
}

async fn handle_status_socket(mut socket: WebSocket, state: AppState) {
    debug!("status stream subscriber connected");

    let snapshot = current_self_status(&state).await;
    let frame = match serde_json::to_string(&snapshot) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    if socket.send(Message::Text(frame)).await.is_err() {
        return;
    }

    let mut updates = state.status_tx.subscribe();
    let mut shutdown = state.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            update = updates.recv() => match update {
                Ok(frame) => {
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                // Slow subscriber skipped frames; resend a full snapshot so
                // it converges again.
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    let snapshot = current_self_status(&state).await;
                    match serde_json::to_string(&snapshot) {
                        Ok(frame) => {
                            if socket.send(Message::Text(frame)).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                Err(_) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }

    debug!("status stream subscriber disconnected");
}

/// GET /loadsharing/status — the full diagnostic object.
pub async fn loadsharing_status(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.read().await.clone();
    let allocation = state.allocation.read().await;
    let divergences: Vec<_> = state.divergences.read().await.values().cloned().collect();

    let (online_count, offline_count, peers) = {
        let map = state.peers.read().await;
        let online = map.values().filter(|p| p.online).count();
        let offline = map.len() - online;
        let peers: Vec<_> = map
            .values()
            .map(|record| {
                json!({
                    "host": record.host,
                    "id": record.device_id,
                    "name": record.name,
                    "ip": record.ip,
                    "online": record.online,
                    "last_seen_s": record.last_seen.map(|t| t.elapsed().as_secs()),
                    "status": record.status,
                })
            })
            .collect();
        (online, offline, peers)
    };

    Json(json!({
        "enabled": config.enabled,
        "group_id": config.group_id,
        "computed_at": allocation.computed_at,
        "failsafe_active": allocation.failsafe_active,
        "online_count": online_count,
        "offline_count": offline_count,
        "config_consistent": divergences.is_empty(),
        "config_issues": divergences,
        "peers": peers,
        "allocations": allocation.allocations,
        "storage_ok": state.storage_ok.load(Ordering::Relaxed),
    }))
}
