//! Node configuration and the shared group config document.
//!
//! Two layers: [`NodeConfig`] is node-local, loaded from the environment and
//! never replicated. [`GroupConfig`] is the operator-editable document shared
//! by every member of the group; it is persisted as `loadsharing_config.json`
//! and kept in agreement across peers by the config sync worker.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::utils::net;

/// Node-local settings from the environment.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// HTTP listen port
    pub port: u16,
    /// Data directory for persisted documents
    pub data_dir: PathBuf,
    /// Stable device id advertised in status messages
    pub device_id: String,
    /// The host peers use to reach this node (also the self-member entry)
    pub host: String,
    /// How often to start a new mDNS query
    pub discovery_interval_s: u64,
    /// Announce and browse on mDNS at all
    pub mdns_enabled: bool,
}

impl NodeConfig {
    pub fn from_env() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "openevse".to_string());

        Self {
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            data_dir: env::var("LOADSHARE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            device_id: env::var("LOADSHARE_DEVICE_ID")
                .unwrap_or_else(|_| format!("openevse-{}", hostname.to_ascii_lowercase())),
            host: env::var("LOADSHARE_HOST")
                .map(|h| net::normalize_host(&h))
                .unwrap_or_else(|_| format!("{}.local", hostname.to_ascii_lowercase())),
            discovery_interval_s: env::var("LOADSHARE_DISCOVERY_INTERVAL_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            mdns_enabled: env::var("MDNS_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(true),
        }
    }
}

/// Behavior when the node can no longer trust its view of the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailsafeMode {
    /// Force the self-allocation to 0 A
    #[default]
    Disable,
    /// Fall back to a configured safe floor
    SafeCurrent,
}

fn default_group_id() -> String {
    "openevse".to_string()
}

fn default_safety_factor() -> f64 {
    1.0
}

fn default_heartbeat_timeout() -> u32 {
    30
}

fn default_assumed_current() -> f64 {
    6.0
}

fn default_min_charge() -> f64 {
    6.0
}

/// Operator-editable group settings, persisted and replicated.
///
/// `priority` is node-local and never replicated. `config_version` counts
/// operator mutations monotonically; `config_updated_at` is the wall-clock
/// epoch second of the last mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub group_max_current_a: f64,
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_s: u32,
    #[serde(default)]
    pub failsafe_mode: FailsafeMode,
    #[serde(default)]
    pub failsafe_safe_current_a: f64,
    #[serde(default = "default_assumed_current")]
    pub failsafe_peer_assumed_current_a: f64,
    #[serde(default = "default_min_charge")]
    pub min_charge_current_a: f64,
    #[serde(default)]
    pub per_node_max_current_a: Option<f64>,
    /// Lower = higher priority. Stored for the operator; not consulted by
    /// the allocator and not replicated.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub config_version: u32,
    #[serde(default)]
    pub config_updated_at: i64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            group_id: default_group_id(),
            group_max_current_a: 0.0,
            safety_factor: default_safety_factor(),
            heartbeat_timeout_s: default_heartbeat_timeout(),
            failsafe_mode: FailsafeMode::default(),
            failsafe_safe_current_a: 0.0,
            failsafe_peer_assumed_current_a: default_assumed_current(),
            min_charge_current_a: default_min_charge(),
            per_node_max_current_a: None,
            priority: 0,
            config_version: 0,
            config_updated_at: 0,
        }
    }
}

impl GroupConfig {
    /// Clamp loaded values into their specified ranges.
    pub fn sanitize(&mut self) {
        if self.heartbeat_timeout_s < 5 {
            tracing::warn!(
                "heartbeat_timeout_s {} below minimum, clamping to 5",
                self.heartbeat_timeout_s
            );
            self.heartbeat_timeout_s = 5;
        }
        self.safety_factor = self.safety_factor.clamp(0.0, 1.0);
        self.group_max_current_a = self.group_max_current_a.max(0.0);
        self.failsafe_safe_current_a = self.failsafe_safe_current_a.max(0.0);
        self.failsafe_peer_assumed_current_a = self.failsafe_peer_assumed_current_a.max(0.0);
    }
}

/// SHA-256 fingerprint over the replicated critical fields.
///
/// Canonical form: JSON with keys in lexicographic order, no whitespace,
/// members lowercased and sorted. `members` is the full group member set
/// including this node's own host, so every member hashes the same list.
pub fn config_hash(config: &GroupConfig, members: &[String]) -> String {
    let mut sorted: Vec<String> = members.iter().map(|m| net::normalize_host(m)).collect();
    sorted.sort();
    sorted.dedup();

    // serde_json maps are keyed by BTreeMap: serialization is already in
    // lexicographic key order with no whitespace.
    let canonical = json!({
        "group_id": config.group_id,
        "group_max_current_a": config.group_max_current_a,
        "members": sorted,
        "safety_factor": config.safety_factor,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Group config as it travels between peers (`GET`/`POST /config`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireConfig {
    pub device_id: String,
    pub enabled: bool,
    pub group_id: String,
    pub group_max_current_a: f64,
    pub safety_factor: f64,
    pub heartbeat_timeout_s: u32,
    pub failsafe_mode: FailsafeMode,
    pub failsafe_safe_current_a: f64,
    pub failsafe_peer_assumed_current_a: f64,
    #[serde(default = "default_min_charge")]
    pub min_charge_current_a: f64,
    #[serde(default)]
    pub per_node_max_current_a: Option<f64>,
    /// Full member set including the sender's own host
    pub members: Vec<String>,
    pub config_version: u32,
    pub config_updated_at: i64,
    pub config_hash: String,
}

impl WireConfig {
    pub fn from_local(
        device_id: &str,
        config: &GroupConfig,
        members: &[String],
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            enabled: config.enabled,
            group_id: config.group_id.clone(),
            group_max_current_a: config.group_max_current_a,
            safety_factor: config.safety_factor,
            heartbeat_timeout_s: config.heartbeat_timeout_s,
            failsafe_mode: config.failsafe_mode,
            failsafe_safe_current_a: config.failsafe_safe_current_a,
            failsafe_peer_assumed_current_a: config.failsafe_peer_assumed_current_a,
            min_charge_current_a: config.min_charge_current_a,
            per_node_max_current_a: config.per_node_max_current_a,
            members: members.to_vec(),
            config_version: config.config_version,
            config_updated_at: config.config_updated_at,
            config_hash: config_hash(config, members),
        }
    }

    /// Schema and range checks for configs received from a peer.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.trim().is_empty() {
            return Err(Error::InvalidInput("group_id cannot be empty".into()));
        }
        if !(self.group_max_current_a >= 0.0) {
            return Err(Error::InvalidInput("group_max_current_a must be >= 0".into()));
        }
        if !(0.0..=1.0).contains(&self.safety_factor) {
            return Err(Error::InvalidInput("safety_factor must be in [0,1]".into()));
        }
        if self.heartbeat_timeout_s < 5 {
            return Err(Error::InvalidInput("heartbeat_timeout_s must be >= 5".into()));
        }
        if !(self.failsafe_safe_current_a >= 0.0)
            || !(self.failsafe_peer_assumed_current_a >= 0.0)
            || !(self.min_charge_current_a >= 0.0)
        {
            return Err(Error::InvalidInput("currents must be >= 0".into()));
        }
        for member in &self.members {
            if !net::valid_host(member) {
                return Err(Error::InvalidInput(format!("invalid member host: {}", member)));
            }
        }
        Ok(())
    }

    /// The replicated fields as a [`GroupConfig`], keeping the receiver's
    /// node-local `priority`.
    pub fn into_group_config(&self, local_priority: i32) -> GroupConfig {
        GroupConfig {
            enabled: self.enabled,
            group_id: self.group_id.clone(),
            group_max_current_a: self.group_max_current_a,
            safety_factor: self.safety_factor,
            heartbeat_timeout_s: self.heartbeat_timeout_s,
            failsafe_mode: self.failsafe_mode,
            failsafe_safe_current_a: self.failsafe_safe_current_a,
            failsafe_peer_assumed_current_a: self.failsafe_peer_assumed_current_a,
            min_charge_current_a: self.min_charge_current_a,
            per_node_max_current_a: self.per_node_max_current_a,
            priority: local_priority,
            config_version: self.config_version,
            config_updated_at: self.config_updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> GroupConfig {
        GroupConfig {
            enabled: true,
            group_id: "garage".into(),
            group_max_current_a: 50.0,
            safety_factor: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn hash_ignores_member_order() {
        let cfg = sample();
        let a = config_hash(
            &cfg,
            &["openevse-b.local".into(), "openevse-a.local".into()],
        );
        let b = config_hash(
            &cfg,
            &["openevse-a.local".into(), "openevse-b.local".into()],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn hash_ignores_member_case() {
        let cfg = sample();
        let a = config_hash(&cfg, &["OpenEVSE-A.local".into()]);
        let b = config_hash(&cfg, &["openevse-a.local".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_tracks_critical_fields_only() {
        let members = vec!["openevse-a.local".to_string()];
        let base = sample();

        let mut changed = base.clone();
        changed.group_max_current_a = 32.0;
        assert_ne!(config_hash(&base, &members), config_hash(&changed, &members));

        // Non-critical fields do not move the fingerprint
        let mut cosmetic = base.clone();
        cosmetic.priority = 7;
        cosmetic.heartbeat_timeout_s = 60;
        cosmetic.config_version = 99;
        assert_eq!(config_hash(&base, &members), config_hash(&cosmetic, &members));
    }

    #[test]
    fn wire_config_round_trips_hashable_fields() {
        let members = vec!["openevse-a.local".to_string(), "openevse-b.local".to_string()];
        let cfg = sample();
        let wire = WireConfig::from_local("openevse-a", &cfg, &members);

        let adopted = wire.into_group_config(3);
        assert_eq!(adopted.group_id, cfg.group_id);
        assert_eq!(adopted.group_max_current_a, cfg.group_max_current_a);
        assert_eq!(adopted.priority, 3, "priority is not replicated");
        assert_eq!(config_hash(&adopted, &members), wire.config_hash);
    }

    #[test]
    fn validate_rejects_out_of_range() {
        let members = vec!["openevse-a.local".to_string()];
        let mut wire = WireConfig::from_local("openevse-a", &sample(), &members);
        assert!(wire.validate().is_ok());

        wire.safety_factor = 1.5;
        assert!(wire.validate().is_err());
        wire.safety_factor = 1.0;

        wire.heartbeat_timeout_s = 2;
        assert!(wire.validate().is_err());
        wire.heartbeat_timeout_s = 30;

        wire.members = vec!["not-a-host".into()];
        assert!(wire.validate().is_err());
    }

    #[test]
    fn sanitize_clamps_heartbeat_floor() {
        let mut cfg = sample();
        cfg.heartbeat_timeout_s = 1;
        cfg.safety_factor = 2.0;
        cfg.sanitize();
        assert_eq!(cfg.heartbeat_timeout_s, 5);
        assert_eq!(cfg.safety_factor, 1.0);
    }
}
