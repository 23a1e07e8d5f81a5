//! Equal-Share-With-Minimums allocation.
//!
//! Every node runs the same pure function over the same observed inputs and
//! arrives at the same map; only the local entry is enforced. All arithmetic
//! is integer deci-amps, rounded toward zero, so identical inputs produce
//! byte-identical maps on every CPU. The member set is sorted by device id
//! before any budget is handed out, which makes the computation independent
//! of input order and of which node runs it.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::debug;

use crate::models::allocation::{amps_to_da, da_to_amps, Allocation, AllocationReason};
use crate::services::enforcement::{self, EnforcementBridge};
use crate::services::failsafe;
use crate::state::AppState;

/// How often the allocator re-runs with no triggering event.
const FALLBACK_INTERVAL: Duration = Duration::from_secs(5);

/// Group-level allocation inputs on the deci-amp grid.
#[derive(Debug, Clone, Copy)]
pub struct GroupView {
    /// `group_max_current_a × safety_factor`
    pub budget_da: i64,
    /// Reserved per offline member before anyone is served
    pub assumed_offline_da: i64,
    /// Minimum grant per demanding member
    pub min_da: i64,
}

/// One member (peer or self) as the allocator sees it.
#[derive(Debug, Clone)]
pub struct MemberState {
    pub id: String,
    pub online: bool,
    /// Vehicle connected and state permits charging
    pub demanding: bool,
    /// Pilot if reported, else the per-node cap, else the group limit
    pub max_da: i64,
}

/// Compute the allocation map. Pure and deterministic: the result depends
/// only on the arguments, never on input order.
pub fn allocate(view: &GroupView, members: &[MemberState]) -> Vec<Allocation> {
    let mut ordered: Vec<&MemberState> = members.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    let offline = ordered.iter().filter(|m| !m.online).count() as i64;
    let reserve = offline * view.assumed_offline_da;
    let avail = (view.budget_da - reserve).max(0);

    let demanding: Vec<&MemberState> = ordered
        .iter()
        .filter(|m| m.online && m.demanding)
        .copied()
        .collect();

    if demanding.is_empty() {
        return ordered
            .into_iter()
            .map(|m| Allocation {
                id: m.id.clone(),
                target_da: 0,
                reason: AllocationReason::NoDemand,
            })
            .collect();
    }

    let n = demanding.len();
    let sum_min = view.min_da * n as i64;
    let mut grant = vec![0i64; n];
    let mut reason = vec![AllocationReason::EqualShare; n];

    if avail >= sum_min {
        // Everyone gets the minimum, then the surplus is split equally.
        // Capping a member returns its excess to the pool for the rest.
        for g in grant.iter_mut() {
            *g = view.min_da;
        }
        let mut pool = avail - sum_min;
        let mut uncapped: Vec<usize> = (0..n).collect();
        while pool > 0 && !uncapped.is_empty() {
            let share = pool / uncapped.len() as i64;
            if share == 0 {
                break;
            }
            pool -= share * uncapped.len() as i64;
            let mut still = Vec::with_capacity(uncapped.len());
            for &i in &uncapped {
                grant[i] += share;
                if grant[i] >= demanding[i].max_da {
                    pool += grant[i] - demanding[i].max_da;
                    grant[i] = demanding[i].max_da;
                    reason[i] = AllocationReason::CappedAtMax;
                } else {
                    still.push(i);
                }
            }
            uncapped = still;
        }
    } else {
        // Not enough for every minimum: grant whole minimums in device-id
        // order until the budget runs out.
        let mut remaining = avail;
        for i in 0..n {
            if remaining >= view.min_da {
                grant[i] = view.min_da;
                remaining -= view.min_da;
            } else {
                reason[i] = AllocationReason::StarvedBySort;
            }
        }
    }

    // Rounding must never push the sum over the budget; shave the lex-last
    // member until it fits.
    let mut total: i64 = grant.iter().sum();
    while total > avail {
        match (0..n).rev().find(|&i| grant[i] > 0) {
            Some(i) => {
                grant[i] -= 1;
                total -= 1;
            }
            None => break,
        }
    }

    let granted: BTreeMap<&str, (i64, AllocationReason)> = demanding
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), (grant[i], reason[i])))
        .collect();

    ordered
        .into_iter()
        .map(|m| {
            let (target_da, reason) = if !m.online {
                (0, AllocationReason::OfflineReserved)
            } else if let Some(&(da, reason)) = granted.get(m.id.as_str()) {
                (da, reason)
            } else {
                (0, AllocationReason::NoDemand)
            };
            Allocation {
                id: m.id.clone(),
                target_da,
                reason,
            }
        })
        .collect()
}

/// One full evaluation: gather inputs, allocate, apply the failsafe, and
/// compute the two power figures for the enforcement bridge.
pub struct Evaluation {
    pub allocations: Vec<Allocation>,
    pub failsafe_active: bool,
    pub self_target_da: i64,
    pub max_power_w: f64,
    pub live_power_w: f64,
}

pub async fn evaluate(state: &AppState) -> Evaluation {
    let config = state.config.read().await.clone();

    // While the group config is inconsistent, run against the most
    // conservative limit any member believes in.
    let mut group_max = config.group_max_current_a;
    for divergence in state.divergences.read().await.values() {
        if let Some(peer_max) = divergence.peer_group_max_current_a {
            group_max = group_max.min(peer_max);
        }
    }

    let group_max_da = amps_to_da(group_max);
    let view = GroupView {
        budget_da: amps_to_da(group_max * config.safety_factor),
        assumed_offline_da: amps_to_da(config.failsafe_peer_assumed_current_a),
        min_da: amps_to_da(config.min_charge_current_a),
    };
    let per_node_cap_da = config.per_node_max_current_a.map(amps_to_da);
    let max_for = |pilot: f64| -> i64 {
        let pilot_da = amps_to_da(pilot);
        if pilot_da > 0 {
            pilot_da
        } else {
            per_node_cap_da.unwrap_or(group_max_da)
        }
    };

    let self_status = state.self_status.read().await.clone();
    let local_voltage = self_status.as_ref().map(|s| s.voltage).unwrap_or(0.0);

    let mut members = Vec::new();
    let mut live_power_w = 0.0;
    let (joined, offline_joined) = {
        let peers = state.peers.read().await;
        let joined = peers.len();
        let mut offline = 0usize;
        for record in peers.values() {
            if !record.online {
                offline += 1;
            }
            let status = record.status.as_ref();
            members.push(MemberState {
                id: record.alloc_id().to_string(),
                online: record.online,
                demanding: record.online
                    && status.map(|s| s.demanding()).unwrap_or(false),
                max_da: max_for(status.map(|s| s.pilot).unwrap_or(0.0)),
            });
            if record.online {
                if let Some(status) = status {
                    let voltage =
                        enforcement::select_voltage(status.voltage, local_voltage);
                    live_power_w += status.amp * voltage;
                }
            }
        }
        (joined, offline)
    };

    let self_id = state.node.device_id.clone();
    members.push(MemberState {
        id: self_id.clone(),
        online: true,
        demanding: self_status.as_ref().map(|s| s.demanding()).unwrap_or(false),
        max_da: max_for(self_status.as_ref().map(|s| s.pilot).unwrap_or(0.0)),
    });

    let allocations = allocate(&view, &members);
    let allocator_self_da = allocations
        .iter()
        .find(|a| a.id == self_id)
        .map(|a| a.target_da)
        .unwrap_or(0);

    let verdict = failsafe::evaluate(
        &config,
        view.budget_da,
        joined,
        offline_joined,
        self_status.is_some(),
        allocator_self_da,
    );

    let self_voltage = enforcement::select_voltage(local_voltage, 0.0);
    let max_power_w = da_to_amps(verdict.self_target_da) * self_voltage;

    Evaluation {
        allocations,
        failsafe_active: verdict.active,
        self_target_da: verdict.self_target_da,
        max_power_w,
        live_power_w,
    }
}

/// Allocator worker: recompute on every signal (status mutation, heartbeat
/// transition, config change) and at least every 5 seconds, then hand the
/// result to the enforcement bridge. Unchanged maps are not re-announced.
pub async fn run_allocator(state: AppState, bridge: EnforcementBridge) {
    let mut shutdown = state.shutdown.clone();
    let mut last_map: Option<Vec<Allocation>> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = state.alloc_notify.notified() => {}
            _ = tokio::time::sleep(FALLBACK_INTERVAL) => {}
        }

        if !state.config.read().await.enabled {
            let mut out = state.allocation.write().await;
            if !out.allocations.is_empty() || out.failsafe_active {
                *out = Default::default();
                last_map = None;
            }
            continue;
        }

        let eval = evaluate(&state).await;

        let changed = last_map.as_ref() != Some(&eval.allocations);
        {
            let mut out = state.allocation.write().await;
            out.allocations = eval.allocations.clone();
            out.computed_at = Some(chrono::Utc::now());
            out.failsafe_active = eval.failsafe_active;
            out.self_target_da = eval.self_target_da;
        }

        if changed {
            debug!(
                "allocation recomputed: self={}A failsafe={}",
                da_to_amps(eval.self_target_da),
                eval.failsafe_active
            );
        }

        bridge.emit(eval.max_power_w, eval.live_power_w, eval.failsafe_active);
        last_map = Some(eval.allocations);
    }
}
