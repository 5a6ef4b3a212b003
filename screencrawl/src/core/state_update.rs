//! Orchestrator-owned status transitions for coverage plans.
//!
//! Only these functions change `Flow::status` or `Flow::waived`. Completed is
//! terminal: no transition here ever moves a flow out of `completed`.

use std::collections::HashSet;

use tracing::warn;

use crate::core::plan::{CoveragePlan, Section};
use crate::core::types::{CoverageReport, FlowStatus, PlanUpdateSummary};

/// Mark `flow_id` as in progress if it is still pending.
pub fn mark_in_progress(
    plan: &mut CoveragePlan,
    flow_id: &str,
    summary: &mut PlanUpdateSummary,
) -> Result<(), String> {
    let flow = plan
        .flow_mut(flow_id)
        .ok_or_else(|| format!("flow '{}' not found", flow_id))?;
    if flow.status == FlowStatus::Pending {
        flow.status = FlowStatus::InProgress;
        summary.started.push(flow.id.clone());
    }
    Ok(())
}

/// Mark flows completed by `report`.
///
/// A flow is only marked when the report names an evidence record for it, so
/// the "completed implies evidence" invariant holds after every update.
pub fn apply_report(
    plan: &mut CoveragePlan,
    report: &CoverageReport,
    summary: &mut PlanUpdateSummary,
) {
    for section in &mut plan.sections {
        for flow in &mut section.flows {
            if flow.status == FlowStatus::Completed {
                continue;
            }
            if report.completed.contains(&flow.id) && report.matched_evidence.contains_key(&flow.id)
            {
                flow.status = FlowStatus::Completed;
                summary.completed_set.push(flow.id.clone());
            }
        }
    }
}

/// Block an open flow after repeated stalls.
pub fn mark_blocked(
    plan: &mut CoveragePlan,
    flow_id: &str,
    summary: &mut PlanUpdateSummary,
) -> Result<(), String> {
    let flow = plan
        .flow_mut(flow_id)
        .ok_or_else(|| format!("flow '{}' not found", flow_id))?;
    if flow.status.is_open() {
        flow.status = FlowStatus::Blocked;
        summary.blocked_set.push(flow.id.clone());
    }
    Ok(())
}

/// Merge a revised section into the section called `target`.
///
/// Existing flows keep their status and position. Flows with new ids are
/// appended as pending. Ids already owned by another section are dropped.
/// Prerequisites of appended flows that name no known flow are discarded, so
/// the merge cannot introduce dangling edges or cycles.
pub fn merge_section(
    plan: &mut CoveragePlan,
    target: &str,
    revised: Section,
    summary: &mut PlanUpdateSummary,
) -> Result<(), String> {
    let mut known: HashSet<String> = plan.flow_ids().into_iter().map(str::to_string).collect();
    let owned: HashSet<String> = plan
        .section(target)
        .ok_or_else(|| format!("section '{}' not found", target))?
        .flows
        .iter()
        .map(|flow| flow.id.clone())
        .collect();

    let mut appended = Vec::new();
    for mut flow in revised.flows {
        if owned.contains(&flow.id) {
            continue;
        }
        if known.contains(&flow.id) {
            warn!(flow = %flow.id, section = target, "dropping revised flow owned by another section");
            continue;
        }
        flow.status = FlowStatus::Pending;
        flow.waived = false;
        flow.prerequisites.retain(|id| known.contains(id));
        known.insert(flow.id.clone());
        summary.added.push(flow.id.clone());
        appended.push(flow);
    }

    let section = plan
        .section_mut(target)
        .ok_or_else(|| format!("section '{}' not found", target))?;
    if section.description.is_empty() {
        section.description = revised.description;
    }
    section.flows.extend(appended);
    Ok(())
}

/// Waive every blocked flow in `target` so it counts toward coverage.
pub fn waive_blocked(plan: &mut CoveragePlan, target: &str, summary: &mut PlanUpdateSummary) {
    let Some(section) = plan.section_mut(target) else {
        return;
    };
    for flow in &mut section.flows {
        if flow.status == FlowStatus::Blocked && !flow.waived {
            flow.waived = true;
            summary.waived.push(flow.id.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plan::Flow;
    use crate::test_support::{flow, flow_after, flow_with_status, plan_with_sections, section};

    fn report_completing(ids: &[&str]) -> CoverageReport {
        let mut report = CoverageReport::default();
        for (index, id) in ids.iter().enumerate() {
            report.completed.insert((*id).to_string());
            report.matched_evidence.insert((*id).to_string(), index);
        }
        report
    }

    #[test]
    fn in_progress_only_moves_pending_flows() {
        let mut plan = plan_with_sections(vec![section(
            "Main",
            vec![flow("a"), flow_with_status("b", FlowStatus::Completed)],
        )]);
        let mut summary = PlanUpdateSummary::default();
        mark_in_progress(&mut plan, "a", &mut summary).expect("mark a");
        mark_in_progress(&mut plan, "b", &mut summary).expect("mark b");

        assert_eq!(plan.flow("a").map(|f| f.status), Some(FlowStatus::InProgress));
        assert_eq!(plan.flow("b").map(|f| f.status), Some(FlowStatus::Completed));
        assert_eq!(summary.started, vec!["a".to_string()]);
    }

    #[test]
    fn unknown_flow_is_an_error() {
        let mut plan = plan_with_sections(vec![section("Main", vec![flow("a")])]);
        let mut summary = PlanUpdateSummary::default();
        let err = mark_blocked(&mut plan, "missing", &mut summary).expect_err("missing flow");
        assert!(err.contains("missing"));
    }

    #[test]
    fn apply_report_requires_matched_evidence() {
        let mut plan = plan_with_sections(vec![section("Main", vec![flow("a"), flow("b")])]);
        let mut report = report_completing(&["a"]);
        report.completed.insert("b".to_string());

        let mut summary = PlanUpdateSummary::default();
        apply_report(&mut plan, &report, &mut summary);

        assert_eq!(plan.flow("a").map(|f| f.status), Some(FlowStatus::Completed));
        assert_eq!(plan.flow("b").map(|f| f.status), Some(FlowStatus::Pending));
        assert_eq!(summary.completed_set, vec!["a".to_string()]);
    }

    #[test]
    fn blocked_flow_can_still_complete_but_completed_never_blocks() {
        let mut plan = plan_with_sections(vec![section(
            "Main",
            vec![flow_with_status("a", FlowStatus::Blocked), flow("b")],
        )]);
        let mut summary = PlanUpdateSummary::default();
        apply_report(&mut plan, &report_completing(&["a", "b"]), &mut summary);
        mark_blocked(&mut plan, "b", &mut summary).expect("block b");

        assert_eq!(plan.flow("a").map(|f| f.status), Some(FlowStatus::Completed));
        assert_eq!(plan.flow("b").map(|f| f.status), Some(FlowStatus::Completed));
        assert!(summary.blocked_set.is_empty());
    }

    #[test]
    fn merge_keeps_existing_flows_and_appends_new_ones() {
        let mut plan = plan_with_sections(vec![
            section(
                "Account",
                vec![flow_with_status("login", FlowStatus::Blocked), flow("logout")],
            ),
            section("Settings", vec![flow("theme")]),
        ]);
        let mut revised_login = flow("login");
        revised_login.description = "rewritten".to_string();
        let revised = section(
            "Account",
            vec![
                revised_login,
                flow_after("guest-mode", &["theme", "ghost"]),
                flow("theme"),
            ],
        );

        let mut summary = PlanUpdateSummary::default();
        merge_section(&mut plan, "Account", revised, &mut summary).expect("merge");

        let account = plan.section("Account").expect("account section");
        let ids: Vec<&str> = account.flows.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["login", "logout", "guest-mode"]);
        assert_eq!(account.flows[0].status, FlowStatus::Blocked);
        assert_eq!(account.flows[0].description, "login description");
        assert_eq!(account.flows[2].prerequisites, vec!["theme".to_string()]);
        assert_eq!(plan.section("Settings").map(|s| s.flows.len()), Some(1));
        assert_eq!(summary.added, vec!["guest-mode".to_string()]);
    }

    #[test]
    fn merged_flows_start_pending_and_unwaived() {
        let mut plan = plan_with_sections(vec![section("Main", vec![flow("a")])]);
        let mut incoming = Flow::new("b", "B");
        incoming.status = FlowStatus::Completed;
        incoming.waived = true;

        let mut summary = PlanUpdateSummary::default();
        merge_section(&mut plan, "Main", section("Main", vec![incoming]), &mut summary)
            .expect("merge");

        let merged = plan.flow("b").expect("merged flow");
        assert_eq!(merged.status, FlowStatus::Pending);
        assert!(!merged.waived);
    }

    #[test]
    fn waive_marks_only_blocked_flows_in_section() {
        let mut plan = plan_with_sections(vec![
            section(
                "Main",
                vec![flow_with_status("a", FlowStatus::Blocked), flow("b")],
            ),
            section("Other", vec![flow_with_status("c", FlowStatus::Blocked)]),
        ]);
        let mut summary = PlanUpdateSummary::default();
        waive_blocked(&mut plan, "Main", &mut summary);
        waive_blocked(&mut plan, "Main", &mut summary);

        assert!(plan.flow("a").is_some_and(|f| f.waived));
        assert!(plan.flow("b").is_some_and(|f| !f.waived));
        assert!(plan.flow("c").is_some_and(|f| !f.waived));
        assert_eq!(summary.waived, vec!["a".to_string()]);
    }
}
