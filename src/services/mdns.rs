//! mDNS announcement and peer discovery.
//!
//! The node announces itself as an `_openevse._tcp` service and runs one
//! background worker that periodically browses for siblings. Queries are
//! bounded: the worker wakes every poll tick, starts a query when the
//! discovery interval has elapsed (or the operator triggered one), collects
//! results until the query timeout, then atomically swaps the snapshot.
//! Callers always read the last completed snapshot and never touch the
//! network.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::models::DiscoveredPeer;
use crate::state::AppState;
use crate::utils::net;

/// Service type for OpenEVSE announcements
pub const SERVICE_TYPE: &str = "_openevse._tcp.local.";

/// How often the worker wakes to check the schedule
const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long a single query collects answers before it is cut off
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
/// Snapshot age after which callers may consider it stale
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(60);

/// Owns the mDNS daemon and this node's own service registration.
pub struct MdnsService {
    daemon: ServiceDaemon,
    own_fullname: Option<String>,
}

impl MdnsService {
    pub fn new(node: &NodeConfig) -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| Error::Mdns(format!("failed to create mDNS daemon: {}", e)))?;

        let mut service = Self {
            daemon,
            own_fullname: None,
        };
        service.register(node)?;
        Ok(service)
    }

    /// Announce this node on the network.
    fn register(&mut self, node: &NodeConfig) -> Result<()> {
        let instance = node
            .host
            .trim_end_matches(".local")
            .trim_end_matches('.')
            .to_string();

        let version = env!("CARGO_PKG_VERSION");
        let properties = [("id", node.device_id.as_str()), ("version", version)];

        let service_info = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &format!("{}.local.", instance),
            (),
            node.port,
            &properties[..],
        )
        .map_err(|e| Error::Mdns(format!("failed to create service info: {}", e)))?
        .enable_addr_auto();

        self.own_fullname = Some(service_info.get_fullname().to_string());

        self.daemon
            .register(service_info)
            .map_err(|e| Error::Mdns(format!("failed to register mDNS service: {}", e)))?;

        info!("📡 mDNS: announcing '{}' on port {}", instance, node.port);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(ref fullname) = self.own_fullname {
            let _ = self.daemon.unregister(fullname);
        }
        let _ = self.daemon.shutdown();
        info!("📡 mDNS: service stopped");
    }
}

/// Discovery worker loop. One query at a time; a trigger only moves the
/// schedule, it never pre-empts an in-flight query.
pub async fn run_discovery(state: AppState, service: MdnsService) {
    let mut shutdown = state.shutdown.clone();
    let discovery_interval = Duration::from_secs(state.node.discovery_interval_s);
    let mut tick = tokio::time::interval(POLL_INTERVAL);
    let mut last_started: Option<Instant> = None;

    info!("🔍 mDNS: starting local network discovery");
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = state.discovery_trigger.notified() => {
                debug!("discovery triggered manually");
                last_started = None;
            }
            _ = tick.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        let due = last_started.map_or(true, |t| t.elapsed() >= discovery_interval);
        if !due {
            continue;
        }
        last_started = Some(Instant::now());

        if let Ok(mut snapshot) = state.discovery.write() {
            snapshot.query_in_progress = true;
        }

        let peers = run_query(&service.daemon, service.own_fullname.as_deref()).await;
        debug!("discovery query complete, found {} peers", peers.len());

        enrich_joined_peers(&state, &peers).await;

        if let Ok(mut snapshot) = state.discovery.write() {
            snapshot.discovery_count += 1;
            snapshot.last_result_count = peers.len();
            snapshot.peers = peers;
            snapshot.completed_at = Some(Instant::now());
            snapshot.query_in_progress = false;
        }
    }

    service.shutdown();
}

/// Run one bounded browse. Network errors, timeouts and empty answers all
/// yield an empty-but-fresh result; they never abort the worker.
async fn run_query(daemon: &ServiceDaemon, own_fullname: Option<&str>) -> Vec<DiscoveredPeer> {
    let receiver = match daemon.browse(SERVICE_TYPE) {
        Ok(receiver) => receiver,
        Err(e) => {
            debug!("mDNS browse failed: {}", e);
            return Vec::new();
        }
    };

    let deadline = Instant::now() + QUERY_TIMEOUT;
    let mut peers: Vec<DiscoveredPeer> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, receiver.recv_async()).await {
            Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                let fullname = info.get_fullname().to_string();
                if Some(fullname.as_str()) == own_fullname {
                    continue;
                }

                let hostname = net::normalize_host(info.get_hostname());
                // Same device answering over several interfaces: first wins
                if !seen.insert(hostname.clone()) {
                    continue;
                }

                peers.push(DiscoveredPeer {
                    hostname,
                    service_name: instance_name(&fullname),
                    ip: info
                        .get_addresses()
                        .iter()
                        .next()
                        .map(|a| a.to_string())
                        .unwrap_or_default(),
                    port: info.get_port(),
                    txt: info
                        .get_properties()
                        .iter()
                        .map(|p| (p.key().to_string(), p.val_str().to_string()))
                        .collect(),
                    discovered_at: chrono::Utc::now(),
                });
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("mDNS browse channel closed: {}", e);
                break;
            }
            Err(_) => break, // query timeout
        }
    }

    let _ = daemon.stop_browse(SERVICE_TYPE);
    peers
}

/// Strip the service type suffix from a fullname.
fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(&format!(".{}", SERVICE_TYPE))
        .unwrap_or(fullname)
        .to_string()
}

/// Fold fresh discovery results into joined peer records: IP, instance
/// name and TXT identity. Discovery never adds or removes members.
async fn enrich_joined_peers(state: &AppState, discovered: &[DiscoveredPeer]) {
    let mut peers = state.peers.write().await;
    for found in discovered {
        let host = net::normalize_host(&found.hostname);
        if let Some(record) = peers.get_mut(&host) {
            if !found.ip.is_empty() {
                record.ip = found.ip.clone();
            }
            record.name = found.service_name.clone();
            if record.device_id.is_empty() {
                if let Some(id) = found.txt.get("id") {
                    record.device_id = id.clone();
                }
            }
            if let Some(version) = found.txt.get("version") {
                record.version = version.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_format() {
        assert!(SERVICE_TYPE.starts_with('_'));
        assert!(SERVICE_TYPE.ends_with(".local."));
    }

    #[test]
    fn instance_name_strips_service_suffix() {
        assert_eq!(
            instance_name("openevse-7856._openevse._tcp.local."),
            "openevse-7856"
        );
        assert_eq!(instance_name("weird-name"), "weird-name");
    }
}
