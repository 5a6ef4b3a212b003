//! Post-evaluation decision policy.
//!
//! `decide` is the pure half of the orchestrator state machine: given the
//! plan (with this iteration's status updates applied), the accepted report
//! and the budget counters, it names the next phase. The orchestrator performs
//! the side effects.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::core::budget::Budget;
use crate::core::plan::CoveragePlan;
use crate::core::selector::next_flow;
use crate::core::types::{CoverageReport, FlowStatus};

pub const NO_REACHABLE_FLOWS: &str = "no reachable flows remain";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Complete,
    Exhaust(String),
    /// Revise the named section.
    Replan(String),
    Explore,
}

/// Decide what follows an evaluation. First matching rule wins:
/// complete, budget, replan, no eligible flow, explore.
pub fn decide(
    plan: &CoveragePlan,
    report: &CoverageReport,
    iterations: u32,
    elapsed: Duration,
    budget: &Budget,
    replanned: &BTreeSet<String>,
) -> Decision {
    if report.is_complete() {
        return Decision::Complete;
    }
    if let Some(reason) = budget.exhausted(iterations, elapsed) {
        return Decision::Exhaust(reason);
    }
    if !report.plan_is_achievable
        && let Some(section) = section_to_replan(plan, replanned)
    {
        return Decision::Replan(section);
    }
    if next_flow(plan).is_none() {
        return Decision::Exhaust(NO_REACHABLE_FLOWS.to_string());
    }
    Decision::Explore
}

/// First section in plan order that owns an unwaived blocked flow and has not
/// been replanned yet.
pub fn section_to_replan(plan: &CoveragePlan, replanned: &BTreeSet<String>) -> Option<String> {
    plan.sections
        .iter()
        .filter(|section| !replanned.contains(&section.name))
        .find(|section| {
            section
                .flows
                .iter()
                .any(|flow| flow.status == FlowStatus::Blocked && !flow.waived)
        })
        .map(|section| section.name.clone())
}
