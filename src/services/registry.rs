//! Peer registry: the operator-declared group membership.
//!
//! The registry is ground truth — discovery only enriches it. Membership is
//! persisted write-through to `loadsharing_peers.json`; a persistence
//! failure is reported to the caller but the in-memory change stands, so a
//! node with a failing flash chip keeps sharing correctly until restart.
//!
//! Membership is part of the replicated config fingerprint, so every
//! add/remove is an operator config mutation: it bumps `config_version`.

use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::models::{PeerRecord, PeerView};
use crate::persist::{Store, CONFIG_DOC, PEERS_DOC};
use crate::state::AppState;
use crate::utils::net;

/// Durable representation of the joined peer set.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PeersDoc {
    #[serde(default)]
    pub peers: Vec<String>,
}

/// Load the configured member hosts, normalized.
pub fn load_members(store: &Store) -> Vec<String> {
    let doc: PeersDoc = store.load(PEERS_DOC);
    doc.peers.iter().map(|h| net::normalize_host(h)).collect()
}

/// Join a peer to the group.
pub async fn add_peer(state: &AppState, host: &str) -> Result<()> {
    let host = net::normalize_host(host);

    if !net::valid_host(&host) {
        return Err(Error::InvalidInput(
            "Invalid host format - must contain domain or IP".into(),
        ));
    }
    if net::is_self_host(&state.node, &host) {
        return Err(Error::InvalidInput("Cannot add this node's own host".into()));
    }

    {
        let mut peers = state.peers.write().await;
        if peers.contains_key(&host) {
            return Err(Error::InvalidInput("Peer already in group".into()));
        }

        let mut record = PeerRecord::new(host.clone());
        // Enrich from the discovery cache when the peer is already visible
        if let Ok(snapshot) = state.discovery.read() {
            if let Some(found) = snapshot
                .peers
                .iter()
                .find(|p| net::normalize_host(&p.hostname) == host)
            {
                record.name = found.service_name.clone();
                record.ip = found.ip.clone();
                if let Some(id) = found.txt.get("id") {
                    record.device_id = id.clone();
                }
                if let Some(version) = found.txt.get("version") {
                    record.version = version.clone();
                }
            }
        }
        peers.insert(host.clone(), record);
    }

    info!("peer {} joined the group", host);
    state.alloc_notify.notify_one();
    finish_membership_change(state).await
}

/// Remove a peer from the group. Exact, case-insensitive match.
pub async fn remove_peer(state: &AppState, host: &str) -> Result<()> {
    let host = net::normalize_host(host);

    if state.peers.write().await.remove(&host).is_none() {
        return Err(Error::NotFound("Peer not found".into()));
    }
    state.divergences.write().await.remove(&host);

    info!("peer {} removed from the group", host);
    state.alloc_notify.notify_one();
    finish_membership_change(state).await
}

/// Bump the config version (membership is fingerprinted) and persist both
/// documents. In-memory state is already mutated; errors only mean the
/// change is volatile.
async fn finish_membership_change(state: &AppState) -> Result<()> {
    {
        let mut config = state.config.write().await;
        config.config_version += 1;
        config.config_updated_at = chrono::Utc::now().timestamp();
        if let Err(e) = state.store.save(CONFIG_DOC, &*config) {
            state.storage_ok.store(false, Ordering::Relaxed);
            warn!("group config not persisted: {}", e);
            return Err(e);
        }
    }
    persist_members(state).await
}

/// Write the current membership through to durable storage.
pub async fn persist_members(state: &AppState) -> Result<()> {
    let doc = PeersDoc {
        peers: state.peers.read().await.keys().cloned().collect(),
    };
    match state.store.save(PEERS_DOC, &doc) {
        Ok(()) => {
            state.storage_ok.store(true, Ordering::Relaxed);
            Ok(())
        }
        Err(e) => {
            state.storage_ok.store(false, Ordering::Relaxed);
            warn!("peer list not persisted: {}", e);
            Err(e)
        }
    }
}

/// Unified view for `GET /loadsharing/peers`: joined members first, then
/// discovered-but-unjoined neighbors.
pub async fn unified_peers(
    state: &AppState,
    include_discovered: bool,
    include_configured: bool,
) -> Vec<PeerView> {
    let mut views = Vec::new();

    let peers = state.peers.read().await;
    for record in peers.values().filter(|_| include_configured) {
        views.push(PeerView {
            id: if record.device_id.is_empty() {
                "unknown".into()
            } else {
                record.device_id.clone()
            },
            name: if record.name.is_empty() {
                record.host.clone()
            } else {
                record.name.clone()
            },
            host: record.host.clone(),
            ip: record.ip.clone(),
            online: record.online,
            joined: true,
        });
    }

    if !include_discovered {
        return views;
    }
    if let Ok(snapshot) = state.discovery.read() {
        for found in &snapshot.peers {
            let host = net::normalize_host(&found.hostname);
            if peers.contains_key(&host) || net::is_self_host(&state.node, &host) {
                continue;
            }
            views.push(PeerView {
                id: found.txt.get("id").cloned().unwrap_or_else(|| "unknown".into()),
                name: found.service_name.clone(),
                host,
                ip: found.ip.clone(),
                online: true,
                joined: false,
            });
        }
    }

    views
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_state;

    #[tokio::test]
    async fn add_then_remove_round_trips() {
        let (state, _rx, _dir) = test_state().await;

        let before = load_members(&state.store);
        add_peer(&state, "openevse-b.local").await.unwrap();
        assert_eq!(
            load_members(&state.store),
            vec!["openevse-b.local".to_string()]
        );

        remove_peer(&state, "openevse-b.local").await.unwrap();
        assert_eq!(load_members(&state.store), before);
        assert!(state.peers.read().await.is_empty());
    }

    #[tokio::test]
    async fn add_rejects_bad_hosts() {
        let (state, _rx, _dir) = test_state().await;

        assert!(matches!(
            add_peer(&state, "garage").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            add_peer(&state, "  ").await,
            Err(Error::InvalidInput(_))
        ));
        // Own host, any spelling
        assert!(add_peer(&state, "Openevse-Self.Local").await.is_err());
    }

    #[tokio::test]
    async fn add_rejects_duplicates_case_insensitively() {
        let (state, _rx, _dir) = test_state().await;

        add_peer(&state, "openevse-b.local").await.unwrap();
        assert!(matches!(
            add_peer(&state, "OPENEVSE-B.LOCAL").await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let (state, _rx, _dir) = test_state().await;
        assert!(matches!(
            remove_peer(&state, "openevse-x.local").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn membership_changes_bump_config_version() {
        let (state, _rx, _dir) = test_state().await;

        let v0 = state.config.read().await.config_version;
        add_peer(&state, "openevse-b.local").await.unwrap();
        let v1 = state.config.read().await.config_version;
        assert_eq!(v1, v0 + 1);

        remove_peer(&state, "openevse-b.local").await.unwrap();
        let v2 = state.config.read().await.config_version;
        assert_eq!(v2, v1 + 1);
    }

    #[tokio::test]
    async fn persisted_set_survives_restart() {
        let (state, _rx, dir) = test_state().await;

        add_peer(&state, "openevse-b.local").await.unwrap();
        add_peer(&state, "openevse-c.local").await.unwrap();
        let in_memory: Vec<String> = state.peers.read().await.keys().cloned().collect();

        // A fresh store on the same directory simulates a restart
        let store = Store::open(dir.path().join("data")).unwrap();
        assert_eq!(load_members(&store), in_memory);
    }
}
