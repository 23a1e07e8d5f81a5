pub mod config;
pub mod health;
pub mod peers;
pub mod status;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Build the full HTTP surface: the peer-consumed endpoints (`/status`,
/// `/config`, `/ws`) and the `/loadsharing` management API.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        // Consumed by sibling nodes
        .route("/status", get(status::own_status))
        .route("/ws", get(status::ws_status))
        .route(
            "/config",
            get(config::get_shared_config).post(config::receive_config),
        )
        // Management and diagnostics
        .route(
            "/loadsharing/peers",
            get(peers::list_peers).post(peers::add_peer),
        )
        .route("/loadsharing/peers/:host", delete(peers::remove_peer))
        .route("/loadsharing/discover", post(peers::discover))
        .route("/loadsharing/discovery", get(peers::discovery_status))
        .route("/loadsharing/status", get(status::loadsharing_status))
        .route(
            "/loadsharing/config",
            get(config::get_group_config).post(config::update_group_config),
        )
        .layer(cors)
        .with_state(state)
}
