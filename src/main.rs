use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loadshare::api;
use loadshare::config::{GroupConfig, NodeConfig};
use loadshare::models::status::{EvseStatus, EVSE_STATE_READY};
use loadshare::persist::{Store, CONFIG_DOC};
use loadshare::services::enforcement::{
    EnforcementBridge, EvseDriver, SimulatedEvse, NOMINAL_VOLTAGE,
};
use loadshare::services::mdns::MdnsService;
use loadshare::services::{allocator, config_sync, enforcement, ingestor, mdns, registry};
use loadshare::state::AppState;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadshare=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let node = NodeConfig::from_env();

    let store = Store::open(&node.data_dir).expect("failed to open data directory");
    let mut group: GroupConfig = store.load(CONFIG_DOC);
    group.sanitize();
    let members = registry::load_members(&store);
    tracing::info!(
        "node {} in group '{}' with {} configured peers",
        node.device_id,
        group.group_id,
        members.len()
    );

    // The real charge controller binding replaces this simulated one;
    // idle and reporting nominal voltage so the engine has valid sensors.
    let driver: Arc<dyn EvseDriver> = Arc::new(SimulatedEvse::new(Some(EvseStatus {
        voltage: NOMINAL_VOLTAGE,
        state: EVSE_STATE_READY,
        ..Default::default()
    })));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (state, sync_rx) = AppState::new(
        node.clone(),
        group,
        members,
        driver,
        store,
        shutdown_rx,
    );

    // Workers
    tokio::spawn(enforcement::run_self_monitor(state.clone()));
    tokio::spawn(ingestor::run_supervisor(state.clone()));
    tokio::spawn(allocator::run_allocator(
        state.clone(),
        EnforcementBridge::new(state.driver.clone()),
    ));
    tokio::spawn(config_sync::run_config_sync(state.clone(), sync_rx));

    if node.mdns_enabled {
        match MdnsService::new(&node) {
            Ok(service) => {
                tokio::spawn(mdns::run_discovery(state.clone(), service));
            }
            Err(e) => tracing::warn!("mDNS unavailable, discovery disabled: {}", e),
        }
    } else {
        tracing::info!("mDNS disabled, relying on configured peers only");
    }

    // HTTP server
    let app = api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], node.port));
    tracing::info!("loadshare node listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");

    // Give workers their flush budget before exiting
    tokio::time::sleep(Duration::from_secs(2)).await;
}
