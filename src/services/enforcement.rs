//! Enforcement bridge to the local charging hardware.
//!
//! The bridge translates the allocator/failsafe output into the two values
//! the charge controller consumes: a power cap for the local node and the
//! observed draw of the rest of the group ("other load"). Emissions are
//! rate-limited so small measurement jitter does not thrash the hardware
//! interface; a failsafe transition always goes through.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::models::status::EvseStatus;
use crate::models::StatusDelta;
use crate::state::AppState;

/// Assumed grid voltage when nobody reports a measurement.
pub const NOMINAL_VOLTAGE: f64 = 240.0;

/// Minimum change worth forwarding: 0.5 A-equivalent at nominal voltage.
pub const EMIT_THRESHOLD_W: f64 = 0.5 * NOMINAL_VOLTAGE;

/// The local charge controller, an external collaborator.
///
/// `status` reads the node's own sensors; `None` means the controller is
/// not reporting, which engages the failsafe. `apply_limits` feeds the
/// power cap and the group's other load to the hardware.
pub trait EvseDriver: Send + Sync {
    fn status(&self) -> Option<EvseStatus>;
    fn apply_limits(&self, max_power_w: f64, live_power_w: f64);
}

/// Voltage selection: the entity's own reading when positive, else the
/// local measurement, else nominal.
pub fn select_voltage(reported: f64, local: f64) -> f64 {
    if reported > 0.0 {
        reported
    } else if local > 0.0 {
        local
    } else {
        NOMINAL_VOLTAGE
    }
}

#[derive(Debug, Clone, Copy)]
struct Emission {
    max_power_w: f64,
    live_power_w: f64,
    failsafe: bool,
}

pub struct EnforcementBridge {
    driver: Arc<dyn EvseDriver>,
    last: Mutex<Option<Emission>>,
}

impl EnforcementBridge {
    pub fn new(driver: Arc<dyn EvseDriver>) -> Self {
        Self {
            driver,
            last: Mutex::new(None),
        }
    }

    /// Forward the pair to the driver if it moved enough to matter.
    /// Returns whether an emission happened.
    pub fn emit(&self, max_power_w: f64, live_power_w: f64, failsafe: bool) -> bool {
        let mut last = self.last.lock().unwrap();

        let should = match *last {
            None => true,
            Some(prev) => {
                prev.failsafe != failsafe
                    || (prev.max_power_w - max_power_w).abs() >= EMIT_THRESHOLD_W
                    || (prev.live_power_w - live_power_w).abs() >= EMIT_THRESHOLD_W
            }
        };

        if should {
            if let Some(prev) = *last {
                if prev.failsafe != failsafe {
                    info!("failsafe {}", if failsafe { "engaged" } else { "cleared" });
                }
            }
            self.driver.apply_limits(max_power_w, live_power_w);
            *last = Some(Emission {
                max_power_w,
                live_power_w,
                failsafe,
            });
        }
        should
    }
}

/// Own-status publisher: polls the local driver, stamps the current config
/// fingerprint, and broadcasts delta frames to `/ws` subscribers. A change
/// in our own demand also re-runs the allocator.
pub async fn run_self_monitor(state: AppState) {
    let mut shutdown = state.shutdown.clone();
    let mut tick = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        let (version, hash) = state.fingerprint().await;
        let next = state.driver.status().map(|mut status| {
            status.id = Some(state.node.device_id.clone());
            status.config_version = version;
            status.config_hash = hash;
            status
        });

        let mut current = state.self_status.write().await;
        if *current == next {
            continue;
        }

        if let (Some(old), Some(new)) = (current.as_ref(), next.as_ref()) {
            let delta = StatusDelta::diff(old, new);
            if !delta.is_empty() {
                if let Ok(frame) = serde_json::to_string(&delta) {
                    let _ = state.status_tx.send(frame);
                }
            }
        } else if next.is_none() {
            debug!("local charge controller stopped reporting");
        }

        *current = next;
        drop(current);
        state.alloc_notify.notify_one();
    }
}

/// In-memory charge controller used by the default binary and by tests.
#[derive(Default)]
pub struct SimulatedEvse {
    inner: Mutex<SimInner>,
}

#[derive(Default)]
struct SimInner {
    status: Option<EvseStatus>,
    applied: Option<(f64, f64)>,
}

impl SimulatedEvse {
    pub fn new(status: Option<EvseStatus>) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                status,
                applied: None,
            }),
        }
    }

    pub fn set_status(&self, status: Option<EvseStatus>) {
        self.inner.lock().unwrap().status = status;
    }

    /// The last `(max_power_w, live_power_w)` pair applied, if any.
    pub fn last_applied(&self) -> Option<(f64, f64)> {
        self.inner.lock().unwrap().applied
    }
}

impl EvseDriver for SimulatedEvse {
    fn status(&self) -> Option<EvseStatus> {
        self.inner.lock().unwrap().status.clone()
    }

    fn apply_limits(&self, max_power_w: f64, live_power_w: f64) {
        self.inner.lock().unwrap().applied = Some((max_power_w, live_power_w));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voltage_priority_order() {
        assert_eq!(select_voltage(229.5, 240.2), 229.5);
        assert_eq!(select_voltage(0.0, 240.2), 240.2);
        assert_eq!(select_voltage(0.0, 0.0), NOMINAL_VOLTAGE);
        assert_eq!(select_voltage(-1.0, 0.0), NOMINAL_VOLTAGE);
    }

    #[test]
    fn small_changes_are_suppressed() {
        let driver = Arc::new(SimulatedEvse::default());
        let bridge = EnforcementBridge::new(driver.clone());

        assert!(bridge.emit(6000.0, 2000.0, false));
        assert_eq!(driver.last_applied(), Some((6000.0, 2000.0)));

        // Under 120 W of movement on both values: no emission
        assert!(!bridge.emit(6050.0, 2080.0, false));
        assert_eq!(driver.last_applied(), Some((6000.0, 2000.0)));

        // Live load alone moving past the threshold emits
        assert!(bridge.emit(6050.0, 2200.0, false));
        assert_eq!(driver.last_applied(), Some((6050.0, 2200.0)));
    }

    #[test]
    fn failsafe_transition_always_emits() {
        let driver = Arc::new(SimulatedEvse::default());
        let bridge = EnforcementBridge::new(driver.clone());

        bridge.emit(6000.0, 2000.0, false);
        assert!(bridge.emit(6000.0, 2000.0, true));
        assert!(bridge.emit(6000.0, 2000.0, false));
        assert!(!bridge.emit(6000.0, 2000.0, false));
    }
}
