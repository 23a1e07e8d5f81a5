//! Shared application state.
//!
//! One `AppState` is cloned into every worker and HTTP handler (it is a
//! bundle of `Arc`s). Readers take short lock scopes and never hold a lock
//! across network I/O.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Notify, RwLock};

use crate::config::{config_hash, GroupConfig, NodeConfig};
use crate::models::{Allocation, DiscoveredPeer, EvseStatus, PeerRecord};
use crate::persist::Store;
use crate::services::enforcement::EvseDriver;
use crate::utils::net;

/// Last completed discovery result plus worker statistics.
#[derive(Debug, Default)]
pub struct DiscoverySnapshot {
    pub peers: Vec<DiscoveredPeer>,
    pub completed_at: Option<Instant>,
    pub discovery_count: u64,
    pub last_result_count: usize,
    pub query_in_progress: bool,
}

impl DiscoverySnapshot {
    /// Within the snapshot TTL? Stale snapshots may still be read.
    pub fn is_fresh(&self, ttl: std::time::Duration) -> bool {
        self.completed_at.map_or(false, |t| t.elapsed() < ttl)
    }
}

/// Latest allocator output.
#[derive(Debug, Default)]
pub struct AllocationState {
    pub allocations: Vec<Allocation>,
    pub computed_at: Option<DateTime<Utc>>,
    pub failsafe_active: bool,
    /// Self entry after the failsafe override, in deci-amps
    pub self_target_da: i64,
}

/// An unresolved config disagreement with one peer.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigDivergence {
    pub host: String,
    pub peer_version: u32,
    pub peer_hash: String,
    /// Peer's group limit when we have seen its full config; the allocator
    /// uses the minimum over these while the group is inconsistent.
    pub peer_group_max_current_a: Option<f64>,
    pub detail: String,
    pub detected_at: DateTime<Utc>,
}

/// Fingerprint mismatch observed by the status ingestor.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub host: String,
    pub peer_version: u32,
    pub peer_hash: String,
}

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<NodeConfig>,
    pub config: Arc<RwLock<GroupConfig>>,
    /// Joined peers keyed by normalized host
    pub peers: Arc<RwLock<BTreeMap<String, PeerRecord>>>,
    pub discovery: Arc<std::sync::RwLock<DiscoverySnapshot>>,
    pub discovery_trigger: Arc<Notify>,
    pub alloc_notify: Arc<Notify>,
    pub allocation: Arc<RwLock<AllocationState>>,
    pub divergences: Arc<RwLock<BTreeMap<String, ConfigDivergence>>>,
    pub sync_tx: mpsc::UnboundedSender<SyncEvent>,
    /// Own-status delta frames, serialized, for `/ws` subscribers
    pub status_tx: broadcast::Sender<String>,
    pub self_status: Arc<RwLock<Option<EvseStatus>>>,
    pub driver: Arc<dyn EvseDriver>,
    pub store: Store,
    pub storage_ok: Arc<AtomicBool>,
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(
        node: NodeConfig,
        config: GroupConfig,
        members: Vec<String>,
        driver: Arc<dyn EvseDriver>,
        store: Store,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(64);

        let mut peers = BTreeMap::new();
        for host in members {
            let host = net::normalize_host(&host);
            if !host.is_empty() && !net::is_self_host(&node, &host) {
                peers.insert(host.clone(), PeerRecord::new(host));
            }
        }

        let state = Self {
            node: Arc::new(node),
            config: Arc::new(RwLock::new(config)),
            peers: Arc::new(RwLock::new(peers)),
            discovery: Arc::new(std::sync::RwLock::new(DiscoverySnapshot::default())),
            discovery_trigger: Arc::new(Notify::new()),
            alloc_notify: Arc::new(Notify::new()),
            allocation: Arc::new(RwLock::new(AllocationState::default())),
            divergences: Arc::new(RwLock::new(BTreeMap::new())),
            sync_tx,
            status_tx,
            self_status: Arc::new(RwLock::new(None)),
            driver,
            store,
            storage_ok: Arc::new(AtomicBool::new(true)),
            shutdown,
        };
        (state, sync_rx)
    }

    /// Full member set for fingerprinting: joined hosts plus self.
    pub async fn members(&self) -> Vec<String> {
        let mut members: Vec<String> = self.peers.read().await.keys().cloned().collect();
        members.push(net::normalize_host(&self.node.host));
        members.sort();
        members
    }

    /// The `(config_version, config_hash)` pair advertised in status
    /// messages.
    pub async fn fingerprint(&self) -> (u32, String) {
        let members = self.members().await;
        let config = self.config.read().await;
        (config.config_version, config_hash(&config, &members))
    }
}
