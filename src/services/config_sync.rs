//! Configuration consistency sub-protocol.
//!
//! Every status message carries the sender's `(config_version, config_hash)`
//! fingerprint. The ingestor reports mismatches here; this worker converges
//! the group by pulling from newer peers, pushing to older ones, and
//! breaking equal-version ties on `config_updated_at` (then device id,
//! higher wins). Until a divergence resolves it stays on the ledger and the
//! allocator runs against the most conservative group limit seen.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{GroupConfig, WireConfig};
use crate::error::Result;
use crate::models::PeerRecord;
use crate::persist::{CONFIG_DOC, PEERS_DOC};
use crate::services::registry::PeersDoc;
use crate::state::{AppState, ConfigDivergence, SyncEvent};
use crate::utils::net;

const PUSH_BACKOFF_S: [u64; 3] = [1, 2, 4];

/// Decide an equal-version conflict: true when the remote record wins.
///
/// Greater `config_updated_at` wins; ties go to the lexicographically
/// higher device id.
pub fn remote_wins(
    local_updated_at: i64,
    local_device_id: &str,
    peer_updated_at: i64,
    peer_device_id: &str,
) -> bool {
    peer_updated_at > local_updated_at
        || (peer_updated_at == local_updated_at && peer_device_id > local_device_id)
}

/// Adopt a config received from a peer (pull result or inbound push).
///
/// Validation must already have passed. The local `priority` is kept, the
/// version becomes the sender's, `config_updated_at` takes the max, and the
/// sender's member list replaces the registry (minus this node's own host).
pub async fn adopt_remote_config(state: &AppState, wire: &WireConfig) -> Result<()> {
    {
        let mut config = state.config.write().await;
        let mut adopted = wire.into_group_config(config.priority);
        adopted.config_updated_at = adopted.config_updated_at.max(config.config_updated_at);
        adopted.sanitize();
        *config = adopted;

        if let Err(e) = state.store.save(CONFIG_DOC, &*config) {
            state.storage_ok.store(false, Ordering::Relaxed);
            warn!("adopted config not persisted: {}", e);
        }
    }

    // Membership travels with the config
    let desired: BTreeSet<String> = wire
        .members
        .iter()
        .map(|m| net::normalize_host(m))
        .filter(|m| !m.is_empty() && !net::is_self_host(&state.node, m))
        .collect();
    {
        let mut peers = state.peers.write().await;
        peers.retain(|host, _| desired.contains(host));
        for host in &desired {
            peers
                .entry(host.clone())
                .or_insert_with(|| PeerRecord::new(host.clone()));
        }
    }
    let doc = PeersDoc {
        peers: desired.into_iter().collect(),
    };
    if let Err(e) = state.store.save(PEERS_DOC, &doc) {
        state.storage_ok.store(false, Ordering::Relaxed);
        warn!("adopted member list not persisted: {}", e);
    }

    state.alloc_notify.notify_one();
    Ok(())
}

async fn fetch_peer_config(
    client: &reqwest::Client,
    host: &str,
) -> crate::error::Result<WireConfig> {
    let url = format!("{}/config", net::peer_base_url(host));
    let wire = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<WireConfig>()
        .await?;
    Ok(wire)
}

async fn record_divergence(
    state: &AppState,
    event: &SyncEvent,
    peer_group_max: Option<f64>,
    detail: &str,
) {
    let mut divergences = state.divergences.write().await;
    divergences.insert(
        event.host.clone(),
        ConfigDivergence {
            host: event.host.clone(),
            peer_version: event.peer_version,
            peer_hash: event.peer_hash.clone(),
            peer_group_max_current_a: peer_group_max,
            detail: detail.to_string(),
            detected_at: chrono::Utc::now(),
        },
    );
    drop(divergences);
    // The conservative budget may have changed
    state.alloc_notify.notify_one();
}

async fn clear_divergence(state: &AppState, host: &str) {
    if state.divergences.write().await.remove(host).is_some() {
        state.alloc_notify.notify_one();
    }
}

/// Pull the peer's full config, validate and adopt it.
async fn pull_from_peer(state: &AppState, client: &reqwest::Client, event: &SyncEvent) {
    let wire = match fetch_peer_config(client, &event.host).await {
        Ok(wire) => wire,
        Err(e) => {
            debug!("config pull from {} failed: {}", event.host, e);
            return;
        }
    };
    if let Err(e) = wire.validate() {
        warn!("rejected invalid config from {}: {}", event.host, e);
        return;
    }

    record_divergence(state, event, Some(wire.group_max_current_a), "pulling newer config").await;

    if let Err(e) = adopt_remote_config(state, &wire).await {
        warn!("failed to adopt config from {}: {}", event.host, e);
        return;
    }
    info!(
        "adopted config v{} from {}",
        wire.config_version, event.host
    );
    clear_divergence(state, &event.host).await;
}

/// Push the local config to a stale peer, with short backoff. A peer that
/// stays unreachable is deferred: the next status message from it raises
/// the event again.
async fn push_to_peer(state: &AppState, client: &reqwest::Client, event: &SyncEvent) {
    let url = format!("{}/config", net::peer_base_url(&event.host));

    for (attempt, delay) in PUSH_BACKOFF_S.iter().enumerate() {
        let wire = local_wire(state).await;
        let result = client.post(&url).json(&wire).send().await;
        match result {
            Ok(response) if response.status().is_success() => {
                info!("pushed config v{} to {}", wire.config_version, event.host);
                clear_divergence(state, &event.host).await;
                return;
            }
            Ok(response) => {
                debug!(
                    "config push to {} rejected: {}",
                    event.host,
                    response.status()
                );
                // The peer disagrees about who is newer; let its next
                // status message drive the resolution.
                return;
            }
            Err(e) => {
                debug!(
                    "config push to {} attempt {}: {}",
                    event.host,
                    attempt + 1,
                    e
                );
            }
        }
        tokio::time::sleep(Duration::from_secs(*delay)).await;
    }
    debug!("config push to {} deferred until it reappears", event.host);
}

async fn local_wire(state: &AppState) -> WireConfig {
    let members = state.members().await;
    let config = state.config.read().await;
    WireConfig::from_local(&state.node.device_id, &config, &members)
}

/// Equal version, different hash: concurrent divergent edits. Fetch the
/// peer's record to compare timestamps and let the winner's config stand.
async fn resolve_conflict(state: &AppState, client: &reqwest::Client, event: &SyncEvent) {
    let wire = match fetch_peer_config(client, &event.host).await {
        Ok(wire) => wire,
        Err(e) => {
            debug!("conflict fetch from {} failed: {}", event.host, e);
            return;
        }
    };
    if let Err(e) = wire.validate() {
        warn!("rejected invalid config from {}: {}", event.host, e);
        return;
    }

    record_divergence(
        state,
        event,
        Some(wire.group_max_current_a),
        "concurrent divergent edits",
    )
    .await;

    let (local_updated_at, local_device_id) = {
        let config = state.config.read().await;
        (config.config_updated_at, state.node.device_id.clone())
    };

    if remote_wins(
        local_updated_at,
        &local_device_id,
        wire.config_updated_at,
        &wire.device_id,
    ) {
        if adopt_remote_config(state, &wire).await.is_ok() {
            info!(
                "conflict with {} resolved: adopted their config v{}",
                event.host, wire.config_version
            );
            clear_divergence(state, &event.host).await;
        }
    } else {
        push_to_peer(state, client, event).await;
    }
}

async fn handle_event(state: &AppState, client: &reqwest::Client, event: SyncEvent) {
    let (local_version, local_hash) = state.fingerprint().await;

    if event.peer_version == local_version && event.peer_hash == local_hash {
        clear_divergence(state, &event.host).await;
        return;
    }

    if event.peer_version > local_version {
        record_divergence(state, &event, None, "peer has newer config").await;
        pull_from_peer(state, client, &event).await;
    } else if event.peer_version < local_version {
        record_divergence(state, &event, None, "peer has older config").await;
        push_to_peer(state, client, &event).await;
    } else {
        resolve_conflict(state, client, &event).await;
    }
}

/// Config sync worker: drains drift events from the ingestor.
pub async fn run_config_sync(
    state: AppState,
    mut events: tokio::sync::mpsc::UnboundedReceiver<SyncEvent>,
) {
    let mut shutdown = state.shutdown.clone();
    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => handle_event(&state, &client, event).await,
                None => break,
            }
        }
    }
}

/// Apply an inbound `POST /config` push from a peer.
///
/// Accepts a strictly newer version outright; for an equal version with a
/// different hash the usual tiebreak decides. Anything older or losing the
/// tiebreak is rejected so the pusher backs off and pulls instead.
pub async fn receive_pushed_config(state: &AppState, wire: &WireConfig) -> Result<bool> {
    wire.validate()?;

    let (local_version, local_hash) = state.fingerprint().await;

    if wire.config_version > local_version {
        // Stale divergence entries clear themselves on the next matching
        // status message from each peer.
        adopt_remote_config(state, wire).await?;
        return Ok(true);
    }

    if wire.config_version == local_version {
        if wire.config_hash == local_hash {
            return Ok(true); // already consistent
        }
        let (local_updated_at, local_device_id) = {
            let config = state.config.read().await;
            (config.config_updated_at, state.node.device_id.clone())
        };
        if remote_wins(
            local_updated_at,
            &local_device_id,
            wire.config_updated_at,
            &wire.device_id,
        ) {
            adopt_remote_config(state, wire).await?;
            return Ok(true);
        }
    }

    Ok(false)
}

/// Operator mutation: apply `edit` to the group config, bump the version,
/// stamp the time and persist. Linearized by the config write lock.
pub async fn mutate_local_config<F>(state: &AppState, edit: F) -> Result<GroupConfig>
where
    F: FnOnce(&mut GroupConfig),
{
    let updated = {
        let mut config = state.config.write().await;
        edit(&mut config);
        config.sanitize();
        config.config_version += 1;
        config.config_updated_at = chrono::Utc::now().timestamp();

        if let Err(e) = state.store.save(CONFIG_DOC, &*config) {
            state.storage_ok.store(false, Ordering::Relaxed);
            warn!("group config not persisted: {}", e);
            return Err(e);
        }
        state.storage_ok.store(true, Ordering::Relaxed);
        config.clone()
    };

    state.alloc_notify.notify_one();
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config_hash;
    use crate::testutil::test_state;

    #[test]
    fn tiebreak_prefers_newer_then_higher_device_id() {
        assert!(remote_wins(100, "openevse-b", 200, "openevse-a"));
        assert!(!remote_wins(200, "openevse-b", 100, "openevse-z"));
        assert!(remote_wins(100, "openevse-a", 100, "openevse-b"));
        assert!(!remote_wins(100, "openevse-b", 100, "openevse-a"));
    }

    #[tokio::test]
    async fn newer_pushed_config_is_adopted() {
        let (state, _rx, _dir) = test_state().await;

        let members = vec![
            "openevse-self.local".to_string(),
            "openevse-b.local".to_string(),
        ];
        let remote = GroupConfig {
            enabled: true,
            group_id: "garage".into(),
            group_max_current_a: 32.0,
            config_version: 5,
            config_updated_at: 1_700_000_000,
            ..Default::default()
        };
        let wire = WireConfig::from_local("openevse-b", &remote, &members);

        assert!(receive_pushed_config(&state, &wire).await.unwrap());

        let config = state.config.read().await;
        assert_eq!(config.config_version, 5);
        assert_eq!(config.group_max_current_a, 32.0);
        drop(config);

        // The member list traveled with the config (self excluded)
        let peers = state.peers.read().await;
        assert!(peers.contains_key("openevse-b.local"));
        assert!(!peers.contains_key("openevse-self.local"));
        drop(peers);

        // And the local fingerprint now matches the sender's
        let (version, hash) = state.fingerprint().await;
        assert_eq!(version, 5);
        assert_eq!(hash, wire.config_hash);
    }

    #[tokio::test]
    async fn stale_pushed_config_is_rejected() {
        let (state, _rx, _dir) = test_state().await;
        mutate_local_config(&state, |config| {
            config.group_max_current_a = 40.0;
        })
        .await
        .unwrap();

        let remote = GroupConfig {
            group_id: "garage".into(),
            group_max_current_a: 99.0,
            config_version: 0,
            ..Default::default()
        };
        let wire = WireConfig::from_local(
            "openevse-b",
            &remote,
            &["openevse-self.local".to_string()],
        );

        assert!(!receive_pushed_config(&state, &wire).await.unwrap());
        assert_eq!(state.config.read().await.group_max_current_a, 40.0);
    }

    #[tokio::test]
    async fn invalid_pushed_config_leaves_state_untouched() {
        let (state, _rx, _dir) = test_state().await;
        let before = state.config.read().await.clone();

        let mut remote = GroupConfig {
            group_id: "garage".into(),
            config_version: 9,
            ..Default::default()
        };
        remote.safety_factor = 3.0; // out of range
        let wire = WireConfig::from_local(
            "openevse-b",
            &remote,
            &["openevse-self.local".to_string()],
        );

        assert!(receive_pushed_config(&state, &wire).await.is_err());
        assert_eq!(*state.config.read().await, before);
    }

    #[tokio::test]
    async fn operator_mutation_bumps_version_and_persists() {
        let (state, _rx, _dir) = test_state().await;
        let v0 = state.config.read().await.config_version;

        let updated = mutate_local_config(&state, |config| {
            config.group_max_current_a = 25.0;
        })
        .await
        .unwrap();

        assert_eq!(updated.config_version, v0 + 1);
        assert!(updated.config_updated_at > 0);

        let persisted: GroupConfig = state.store.load(CONFIG_DOC);
        assert_eq!(persisted.group_max_current_a, 25.0);
        assert_eq!(persisted.config_version, v0 + 1);
    }

    #[tokio::test]
    async fn push_then_pull_yields_identical_hashable_fields() {
        // A pushes to B (adoption), then A pulling B's wire form must see
        // byte-identical hashable fields.
        let (state_b, _rx, _dir) = test_state().await;

        let members = vec![
            "openevse-a.local".to_string(),
            "openevse-self.local".to_string(),
        ];
        let config_a = GroupConfig {
            enabled: true,
            group_id: "garage".into(),
            group_max_current_a: 48.0,
            safety_factor: 0.8,
            config_version: 7,
            config_updated_at: 1_700_000_123,
            ..Default::default()
        };
        let pushed = WireConfig::from_local("openevse-a", &config_a, &members);
        assert!(receive_pushed_config(&state_b, &pushed).await.unwrap());

        let answered = local_wire(&state_b).await;
        assert_eq!(answered.config_hash, pushed.config_hash);
        assert_eq!(answered.config_version, pushed.config_version);
        assert_eq!(
            config_hash(
                &state_b.config.read().await.clone(),
                &state_b.members().await
            ),
            pushed.config_hash
        );
    }
}
