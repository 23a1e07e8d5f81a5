//! Allocation results from the load sharing algorithm.
//!
//! All allocation arithmetic runs on a 0.1 A integer grid (deci-amps) so
//! that every node computes byte-identical maps from identical inputs,
//! regardless of CPU. Conversion to floating amps happens only at the API
//! and driver boundaries.

use serde::{Serialize, Serializer};

/// Convert amps to the deci-amp grid, rounding toward zero.
pub fn amps_to_da(amps: f64) -> i64 {
    (amps * 10.0) as i64
}

/// Convert deci-amps back to amps at the boundary.
pub fn da_to_amps(da: i64) -> f64 {
    da as f64 / 10.0
}

/// Why a member received its target current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationReason {
    /// Minimum granted plus an equal share of the surplus
    EqualShare,
    /// Equal share would have exceeded the member's maximum
    CappedAtMax,
    /// Budget ran out before this member's minimum, in device-id order
    StarvedBySort,
    /// Online but no vehicle / not in a charge-permitting state
    NoDemand,
    /// Offline; its assumed draw is reserved out of the budget instead
    OfflineReserved,
}

/// Per-member current allocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Allocation {
    /// Member device id
    pub id: String,
    /// Allocated current on the deci-amp grid
    #[serde(rename = "target_current_a", serialize_with = "da_as_amps")]
    pub target_da: i64,
    pub reason: AllocationReason,
}

fn da_as_amps<S: Serializer>(da: &i64, ser: S) -> Result<S::Ok, S::Error> {
    ser.serialize_f64(da_to_amps(*da))
}

impl Allocation {
    pub fn target_current_a(&self) -> f64 {
        da_to_amps(self.target_da)
    }
}
