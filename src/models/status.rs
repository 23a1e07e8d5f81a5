//! EVSE status snapshots and partial delta frames.
//!
//! A peer's `/status` resource and the first frame on its `/ws` stream carry
//! a full [`EvseStatus`] snapshot. Every later frame is a [`StatusDelta`]
//! with only the fields that changed; deltas are merged field-wise into the
//! cached snapshot. Unknown JSON fields are ignored on both paths.

use serde::{Deserialize, Serialize};

/// J1772-derived EVSE state codes.
pub const EVSE_STATE_READY: u8 = 1;
pub const EVSE_STATE_CONNECTED: u8 = 2;
pub const EVSE_STATE_CHARGING: u8 = 3;

/// True if the state code permits a charge allocation.
///
/// Unknown codes (errors, sleeping, vendor extensions) never demand current.
pub fn charge_permitting(state: u8) -> bool {
    matches!(state, EVSE_STATE_CONNECTED | EVSE_STATE_CHARGING)
}

/// Full status snapshot for one charger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvseStatus {
    /// Stable device id (e.g. "openevse-a7d4")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Measured current (amps)
    #[serde(default)]
    pub amp: f64,
    /// Measured voltage (volts)
    #[serde(default)]
    pub voltage: f64,
    /// Current pilot setpoint (amps)
    #[serde(default)]
    pub pilot: f64,
    /// 1 if a vehicle is connected, else 0
    #[serde(default)]
    pub vehicle: u8,
    /// EVSE state code
    #[serde(default)]
    pub state: u8,
    /// Config version for drift detection
    #[serde(default)]
    pub config_version: u32,
    /// Config hash for drift detection
    #[serde(default)]
    pub config_hash: String,
}

impl EvseStatus {
    /// Whether this charger is asking for current right now.
    pub fn demanding(&self) -> bool {
        self.vehicle == 1 && charge_permitting(self.state)
    }
}

/// Partial status frame: same shape as [`EvseStatus`] with every field
/// optional. Absent fields leave the cached snapshot untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pilot: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

impl StatusDelta {
    pub fn is_empty(&self) -> bool {
        *self == StatusDelta::default()
    }

    /// Merge this delta into a snapshot, field-wise.
    pub fn apply(&self, status: &mut EvseStatus) {
        if let Some(ref id) = self.id {
            status.id = Some(id.clone());
        }
        if let Some(amp) = self.amp {
            status.amp = amp;
        }
        if let Some(voltage) = self.voltage {
            status.voltage = voltage;
        }
        if let Some(pilot) = self.pilot {
            status.pilot = pilot;
        }
        if let Some(vehicle) = self.vehicle {
            status.vehicle = vehicle;
        }
        if let Some(state) = self.state {
            status.state = state;
        }
        if let Some(version) = self.config_version {
            status.config_version = version;
        }
        if let Some(ref hash) = self.config_hash {
            status.config_hash = hash.clone();
        }
    }

    /// Compute the delta frame that turns `old` into `new`.
    pub fn diff(old: &EvseStatus, new: &EvseStatus) -> StatusDelta {
        StatusDelta {
            id: (old.id != new.id).then(|| new.id.clone()).flatten(),
            amp: (old.amp != new.amp).then_some(new.amp),
            voltage: (old.voltage != new.voltage).then_some(new.voltage),
            pilot: (old.pilot != new.pilot).then_some(new.pilot),
            vehicle: (old.vehicle != new.vehicle).then_some(new.vehicle),
            state: (old.state != new.state).then_some(new.state),
            config_version: (old.config_version != new.config_version)
                .then_some(new.config_version),
            config_hash: (old.config_hash != new.config_hash)
                .then(|| new.config_hash.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_merges_only_present_fields() {
        let mut status = EvseStatus {
            id: Some("openevse-aaaa".into()),
            amp: 12.0,
            voltage: 230.0,
            pilot: 16.0,
            vehicle: 1,
            state: EVSE_STATE_CHARGING,
            config_version: 3,
            config_hash: "abc".into(),
        };

        let delta: StatusDelta = serde_json::from_str(r#"{"amp": 14.5, "state": 2}"#).unwrap();
        delta.apply(&mut status);

        assert_eq!(status.amp, 14.5);
        assert_eq!(status.state, EVSE_STATE_CONNECTED);
        // Untouched fields survive the merge
        assert_eq!(status.voltage, 230.0);
        assert_eq!(status.config_version, 3);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let status: EvseStatus =
            serde_json::from_str(r#"{"amp": 6.0, "wifi_signal": -61, "temp": 32.5}"#).unwrap();
        assert_eq!(status.amp, 6.0);

        let delta: StatusDelta =
            serde_json::from_str(r#"{"pilot": 20.0, "divertmode": 1}"#).unwrap();
        assert_eq!(delta.pilot, Some(20.0));
    }

    #[test]
    fn diff_then_apply_round_trips() {
        let old = EvseStatus {
            amp: 10.0,
            vehicle: 1,
            state: EVSE_STATE_CONNECTED,
            ..Default::default()
        };
        let new = EvseStatus {
            amp: 24.0,
            vehicle: 1,
            state: EVSE_STATE_CHARGING,
            config_version: 2,
            ..Default::default()
        };

        let delta = StatusDelta::diff(&old, &new);
        assert!(delta.vehicle.is_none());

        let mut merged = old.clone();
        delta.apply(&mut merged);
        assert_eq!(merged, new);
    }

    #[test]
    fn unknown_states_never_demand() {
        let mut status = EvseStatus {
            vehicle: 1,
            state: EVSE_STATE_CHARGING,
            ..Default::default()
        };
        assert!(status.demanding());

        status.state = 254; // sleeping
        assert!(!status.demanding());
        status.state = EVSE_STATE_READY;
        assert!(!status.demanding());

        status.state = EVSE_STATE_CONNECTED;
        status.vehicle = 0;
        assert!(!status.demanding());
    }
}
