//! Deterministic flow selection for the explorer.

use std::collections::BTreeSet;

use crate::core::plan::{CoveragePlan, Flow};
use crate::core::types::FlowStatus;

/// Find the highest-priority eligible flow.
///
/// Eligible flows are `pending` or `in_progress` with every prerequisite
/// `completed`. Priority is plan order: the first eligible flow wins.
/// Returns `None` when nothing is eligible.
pub fn next_flow(plan: &CoveragePlan) -> Option<&Flow> {
    plan.flows().find(|flow| is_eligible(plan, flow))
}

pub fn is_eligible(plan: &CoveragePlan, flow: &Flow) -> bool {
    flow.status.is_open()
        && flow.prerequisites.iter().all(|id| {
            plan.flow(id)
                .is_some_and(|prerequisite| prerequisite.status == FlowStatus::Completed)
        })
}

/// Blocked flows plus every open flow that depends on one, transitively.
pub fn unreachable_flows(plan: &CoveragePlan) -> BTreeSet<String> {
    let mut unreachable: BTreeSet<String> = plan
        .flows()
        .filter(|flow| flow.status == FlowStatus::Blocked)
        .map(|flow| flow.id.clone())
        .collect();

    // Fixed point over the prerequisite edges; plans are small.
    loop {
        let before = unreachable.len();
        for flow in plan.flows() {
            if flow.status.is_open()
                && flow
                    .prerequisites
                    .iter()
                    .any(|id| unreachable.contains(id))
            {
                unreachable.insert(flow.id.clone());
            }
        }
        if unreachable.len() == before {
            return unreachable;
        }
    }
}
