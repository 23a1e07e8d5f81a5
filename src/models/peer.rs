//! Peer records and discovery results.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::Serialize;

use crate::models::status::EvseStatus;

/// A peer the operator has joined to the group.
///
/// Created by operator action (or enriched from discovery); removed only by
/// operator action. The cached status snapshot survives transient
/// disconnection but not process restart.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    /// Hostname or IP used to reach the peer (normalized, unique key)
    pub host: String,
    /// Stable device id reported by the peer; empty until first status
    pub device_id: String,
    /// mDNS instance name if discovered
    pub name: String,
    /// Last observed IP address
    pub ip: String,
    /// Firmware/application version from TXT records, if advertised
    pub version: String,
    /// Within the heartbeat window?
    pub online: bool,
    /// Monotonic timestamp of the last successfully parsed message
    pub last_seen: Option<Instant>,
    /// Latest status snapshot
    pub status: Option<EvseStatus>,
}

impl PeerRecord {
    pub fn new(host: String) -> Self {
        Self {
            host,
            device_id: String::new(),
            name: String::new(),
            ip: String::new(),
            version: String::new(),
            online: false,
            last_seen: None,
            status: None,
        }
    }

    /// Allocation sort key: device id when known, host otherwise.
    pub fn alloc_id(&self) -> &str {
        if self.device_id.is_empty() {
            &self.host
        } else {
            &self.device_id
        }
    }
}

/// A peer advertised on the local network.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPeer {
    /// Fully qualified hostname (e.g. "openevse-7856.local")
    pub hostname: String,
    /// Service instance name (e.g. "openevse-7856")
    pub service_name: String,
    /// IP address as string
    pub ip: String,
    /// Service port
    pub port: u16,
    /// TXT records (version, type, id, ...), passed through to the API
    pub txt: BTreeMap<String, String>,
    pub discovered_at: chrono::DateTime<chrono::Utc>,
}

/// Entry in the unified peer list returned by `GET /loadsharing/peers`.
#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub id: String,
    pub name: String,
    pub host: String,
    pub ip: String,
    pub online: bool,
    pub joined: bool,
}
