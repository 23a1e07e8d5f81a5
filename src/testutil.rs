//! Shared helpers for unit tests.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::config::{GroupConfig, NodeConfig};
use crate::persist::Store;
use crate::services::enforcement::SimulatedEvse;
use crate::state::{AppState, SyncEvent};

/// Fresh state against a temporary data directory and a simulated charge
/// controller. The returned `TempDir` keeps the directory alive.
pub async fn test_state() -> (
    AppState,
    mpsc::UnboundedReceiver<SyncEvent>,
    tempfile::TempDir,
) {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeConfig {
        port: 8000,
        data_dir: dir.path().join("data"),
        device_id: "openevse-self".into(),
        host: "openevse-self.local".into(),
        discovery_interval_s: 60,
        mdns_enabled: false,
    };
    let store = Store::open(&node.data_dir).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    std::mem::forget(shutdown_tx);

    let config = GroupConfig {
        enabled: true,
        group_id: "garage".into(),
        group_max_current_a: 50.0,
        ..Default::default()
    };

    let (state, sync_rx) = AppState::new(
        node,
        config,
        Vec::new(),
        Arc::new(SimulatedEvse::default()),
        store,
        shutdown_rx,
    );
    (state, sync_rx, dir)
}
