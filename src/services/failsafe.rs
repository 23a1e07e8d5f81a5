//! Failsafe supervisor.
//!
//! Overrides the allocator's self entry when the node can no longer trust
//! its view of the group: every joined peer has gone silent, or the local
//! sensors themselves are not reporting. A single offline peer never
//! engages the failsafe — the allocator already reserves its assumed draw.

use crate::config::{FailsafeMode, GroupConfig};
use crate::models::allocation::amps_to_da;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailsafeVerdict {
    pub active: bool,
    /// Self-allocation after any override, in deci-amps
    pub self_target_da: i64,
}

/// Evaluate the failsafe rules against the allocator's self entry.
///
/// `budget_da` is `group_max_current_a × safety_factor` on the grid;
/// `joined`/`offline` count joined peers (self excluded); `self_status_ok`
/// is whether the local charge controller is reporting valid readings.
pub fn evaluate(
    config: &GroupConfig,
    budget_da: i64,
    joined: usize,
    offline: usize,
    self_status_ok: bool,
    allocator_self_da: i64,
) -> FailsafeVerdict {
    // A group of one shares with nobody: the whole permitted budget is ours
    // and there is no peer view to distrust.
    if joined == 0 {
        return FailsafeVerdict {
            active: false,
            self_target_da: budget_da,
        };
    }

    let engaged = offline == joined || !self_status_ok;
    if !engaged {
        return FailsafeVerdict {
            active: false,
            self_target_da: allocator_self_da,
        };
    }

    let self_target_da = match config.failsafe_mode {
        FailsafeMode::Disable => 0,
        FailsafeMode::SafeCurrent => {
            amps_to_da(config.failsafe_safe_current_a).min(allocator_self_da)
        }
    };

    FailsafeVerdict {
        active: true,
        self_target_da,
    }
}
