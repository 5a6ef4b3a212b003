//! Plan amendment checks.

use std::collections::HashMap;

use crate::core::plan::{CoveragePlan, Flow};
use crate::core::types::FlowStatus;

/// Validate that `next` only amends `prev`.
///
/// For each flow in `prev`, this check enforces:
/// - The flow still exists in `next`, in the same section.
/// - A completed flow is identical by value.
///
/// Returns a list of stable error messages (sorted by flow id).
pub fn check_plan_amendment(prev: &CoveragePlan, next: &CoveragePlan) -> Vec<String> {
    let next_index: HashMap<&str, (&str, &Flow)> = next
        .sections
        .iter()
        .flat_map(|section| {
            section
                .flows
                .iter()
                .map(move |flow| (flow.id.as_str(), (section.name.as_str(), flow)))
        })
        .collect();

    let mut previous: Vec<(&str, &Flow)> = prev
        .sections
        .iter()
        .flat_map(|section| {
            section
                .flows
                .iter()
                .map(move |flow| (section.name.as_str(), flow))
        })
        .collect();
    previous.sort_by(|a, b| a.1.id.cmp(&b.1.id));

    let mut errors = Vec::new();
    for (section, flow) in previous {
        match next_index.get(flow.id.as_str()) {
            None => errors.push(format!("flow '{}' removed from plan", flow.id)),
            Some((next_section, next_flow)) => {
                if *next_section != section {
                    errors.push(format!(
                        "flow '{}' moved from section '{}' to '{}'",
                        flow.id, section, next_section
                    ));
                }
                if flow.status == FlowStatus::Completed && *next_flow != flow {
                    errors.push(format!("completed flow '{}' changed", flow.id));
                }
            }
        }
    }
    errors
}
