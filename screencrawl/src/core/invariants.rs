//! Semantic plan invariants not expressible via JSON Schema.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::core::plan::CoveragePlan;
use crate::core::types::{Evidence, FlowStatus};

/// Check plan invariants:
/// - At least one section and one flow
/// - No duplicate section names or flow ids
/// - Prerequisites name existing flows and form no cycle
pub fn validate_plan(plan: &CoveragePlan) -> Vec<String> {
    let mut errors = Vec::new();

    if plan.sections.is_empty() {
        errors.push("plan has no sections".to_string());
    }
    if plan.is_empty() {
        errors.push("plan has no flows".to_string());
    }

    let mut names = HashSet::new();
    for section in &plan.sections {
        if !names.insert(section.name.as_str()) {
            errors.push(format!("duplicate section name '{}'", section.name));
        }
    }

    let mut seen = HashSet::new();
    for section in &plan.sections {
        for flow in &section.flows {
            if !seen.insert(flow.id.as_str()) {
                errors.push(format!("duplicate flow id '{}' in {}", flow.id, section.name));
            }
        }
    }

    for flow in plan.flows() {
        for prerequisite in &flow.prerequisites {
            if !seen.contains(prerequisite.as_str()) {
                errors.push(format!(
                    "{}: unknown prerequisite '{}'",
                    flow.id, prerequisite
                ));
            }
            if prerequisite == &flow.id {
                errors.push(format!("{}: flow lists itself as prerequisite", flow.id));
            }
        }
    }

    if let Some(cycle_at) = find_prerequisite_cycle(plan) {
        errors.push(format!("prerequisite cycle through '{}'", cycle_at));
    }

    errors
}

/// Check that every completed flow has evidence attributed or matched to it.
pub fn validate_completed_flows(
    plan: &CoveragePlan,
    evidence: &[Evidence],
    matched: &BTreeMap<String, usize>,
) -> Vec<String> {
    plan.flows()
        .filter(|flow| flow.status == FlowStatus::Completed)
        .filter(|flow| {
            !matched.contains_key(&flow.id)
                && !evidence
                    .iter()
                    .any(|item| item.flow_id.as_deref() == Some(flow.id.as_str()))
        })
        .map(|flow| format!("{}: completed without evidence", flow.id))
        .collect()
}

fn find_prerequisite_cycle(plan: &CoveragePlan) -> Option<String> {
    let edges: HashMap<&str, Vec<&str>> = plan
        .flows()
        .map(|flow| {
            (
                flow.id.as_str(),
                flow.prerequisites.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        id: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Option<&'a str> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::Visiting) => return Some(id),
            None => {}
        }
        marks.insert(id, Mark::Visiting);
        for &next in edges.get(id).into_iter().flatten() {
            if let Some(found) = visit(next, edges, marks) {
                return Some(found);
            }
        }
        marks.insert(id, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    for flow in plan.flows() {
        if let Some(found) = visit(flow.id.as_str(), &edges, &mut marks) {
            return Some(found.to_string());
        }
    }
    None
}
