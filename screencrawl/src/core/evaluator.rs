//! Coverage evaluation: compare accumulated evidence against the plan.
//!
//! `evaluate` is a function of (plan, evidence, classifier) bounded by a
//! wall-clock deadline. Before the deadline it is monotonic in evidence
//! (adding evidence never un-completes a flow) and idempotent (identical
//! inputs give an identical report).

use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, instrument};

use crate::core::classifier::Classifier;
use crate::core::plan::{CoveragePlan, Flow};
use crate::core::selector::unreachable_flows;
use crate::core::types::{CoverageReport, Evidence, FlowStatus};

/// Maximum number of next-flow hints included in feedback.
const FEEDBACK_HINTS: usize = 3;

/// Acceptance threshold and cutoff for one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct EvalLimits {
    pub min_confidence: f64,
    /// No classification starts at or after this instant.
    pub deadline: Instant,
}

/// Build a coverage report for `plan` given every evidence record so far.
///
/// A flow counts as completed when the plan already marks it completed, or
/// when some evidence classifies as completed for it with confidence at or
/// above `limits.min_confidence`. The first matching evidence index is
/// recorded. Flows the plan already marks completed are not classified
/// again: they keep their index from `prior`, falling back to evidence
/// captured while exploring them.
#[instrument(skip_all, fields(flows = plan.flow_count(), evidence = evidence.len()))]
pub fn evaluate<K: Classifier + ?Sized>(
    plan: &CoveragePlan,
    evidence: &[Evidence],
    prior: &CoverageReport,
    classifier: &K,
    limits: EvalLimits,
) -> CoverageReport {
    let mut report = CoverageReport::default();

    for flow in plan.flows() {
        let index = if flow.status == FlowStatus::Completed {
            prior
                .matched_evidence
                .get(&flow.id)
                .copied()
                .filter(|index| *index < evidence.len())
                .or_else(|| first_attributed(flow, evidence))
                .or_else(|| first_match(flow, evidence, classifier, limits))
        } else {
            first_match(flow, evidence, classifier, limits)
        };
        if flow.status == FlowStatus::Completed || index.is_some() {
            report.completed.insert(flow.id.clone());
            if let Some(index) = index {
                report.matched_evidence.insert(flow.id.clone(), index);
            }
        } else {
            report.remaining.insert(flow.id.clone());
            if flow.status == FlowStatus::Blocked {
                report.blocked.insert(flow.id.clone());
            }
        }
    }

    report.unreachable = unreachable_flows(plan)
        .into_iter()
        .filter(|id| !report.completed.contains(id))
        .collect();

    let waived: BTreeSet<&str> = plan
        .flows()
        .filter(|flow| flow.waived && report.blocked.contains(&flow.id))
        .map(|flow| flow.id.as_str())
        .collect();

    let total = plan.flow_count();
    report.completion_ratio = if total == 0 {
        0.0
    } else {
        (report.completed.len() + waived.len()) as f64 / total as f64
    };
    report.plan_is_achievable = report
        .blocked
        .iter()
        .all(|id| waived.contains(id.as_str()));
    report.feedback = feedback(plan, &report);

    debug!(
        completed = report.completed.len(),
        remaining = report.remaining.len(),
        ratio = report.completion_ratio,
        achievable = report.plan_is_achievable,
        "coverage evaluated"
    );
    report
}

/// List flows completed in `prev` that are missing from `next`.
///
/// A non-empty result means the evaluator regressed; the caller must reject
/// `next` and keep `prev`.
pub fn find_regressions(prev: &CoverageReport, next: &CoverageReport) -> Vec<String> {
    prev.completed
        .difference(&next.completed)
        .map(|id| format!("flow '{id}' was completed and is no longer"))
        .collect()
}

fn first_match<K: Classifier + ?Sized>(
    flow: &Flow,
    evidence: &[Evidence],
    classifier: &K,
    limits: EvalLimits,
) -> Option<usize> {
    for (index, item) in evidence.iter().enumerate() {
        if Instant::now() >= limits.deadline {
            debug!(flow = %flow.id, "evaluation deadline reached");
            return None;
        }
        let verdict = classifier.classify(item, flow, limits.deadline);
        if verdict.completed && verdict.confidence >= limits.min_confidence {
            return Some(index);
        }
    }
    None
}

fn first_attributed(flow: &Flow, evidence: &[Evidence]) -> Option<usize> {
    evidence
        .iter()
        .position(|item| item.flow_id.as_deref() == Some(flow.id.as_str()))
}

fn feedback(plan: &CoveragePlan, report: &CoverageReport) -> String {
    if report.remaining.is_empty() {
        return format!("All {} flows have evidence.", plan.flow_count());
    }

    let next: Vec<String> = plan
        .flows()
        .filter(|flow| report.remaining.contains(&flow.id))
        .filter(|flow| !report.unreachable.contains(&flow.id))
        .filter(|flow| {
            flow.prerequisites
                .iter()
                .all(|id| report.completed.contains(id))
        })
        .take(FEEDBACK_HINTS)
        .map(|flow| format!("{} ({})", flow.description, flow.id))
        .collect();

    let mut buf = format!(
        "{} of {} flows covered.",
        report.completed.len(),
        plan.flow_count()
    );
    if !next.is_empty() {
        buf.push_str(" Capture next: ");
        buf.push_str(&next.join("; "));
        buf.push('.');
    }
    if !report.unreachable.is_empty() {
        let ids: Vec<&str> = report.unreachable.iter().map(String::as_str).collect();
        buf.push_str(" Unreachable: ");
        buf.push_str(&ids.join(", "));
        buf.push('.');
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::classifier::{Classification, KeywordClassifier};
    use crate::test_support::{
        evidence_for, evidence_with_labels, expect_flow, flow_after, flow_with_status, limits,
        plan_with_sections, section,
    };
    use std::cell::RefCell;

    fn two_flow_plan() -> CoveragePlan {
        plan_with_sections(vec![section(
            "Main",
            vec![
                expect_flow("home", &["Home"]),
                expect_flow("settings", &["Settings", "Dark Mode"]),
            ],
        )])
    }

    #[test]
    fn empty_evidence_completes_nothing() {
        let plan = two_flow_plan();
        let report = evaluate(&plan, &[], &CoverageReport::default(), &KeywordClassifier, limits());
        assert!(report.completed.is_empty());
        assert_eq!(report.remaining.len(), 2);
        assert_eq!(report.completion_ratio, 0.0);
        assert!(report.plan_is_achievable);
        assert!(report.feedback.contains("Capture next"));
    }

    #[test]
    fn matching_evidence_completes_flow_and_records_index() {
        let plan = two_flow_plan();
        let evidence = vec![
            evidence_with_labels(&["Login"]),
            evidence_with_labels(&["Home", "Feed"]),
        ];
        let report = evaluate(&plan, &evidence, &CoverageReport::default(), &KeywordClassifier, limits());
        assert!(report.completed.contains("home"));
        assert_eq!(report.matched_evidence.get("home"), Some(&1));
        assert_eq!(report.completion_ratio, 0.5);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let plan = two_flow_plan();
        let evidence = vec![evidence_with_labels(&["Home"])];
        let classifier = KeywordClassifier;
        let first = evaluate(&plan, &evidence, &CoverageReport::default(), &classifier, limits());
        let second = evaluate(&plan, &evidence, &CoverageReport::default(), &classifier, limits());
        assert_eq!(first, second);
    }

    #[test]
    fn evaluation_is_monotonic_in_evidence() {
        let plan = two_flow_plan();
        let classifier = KeywordClassifier;
        let pool = vec![
            evidence_with_labels(&["Settings"]),
            evidence_with_labels(&["Home"]),
            evidence_with_labels(&["Settings", "Dark Mode"]),
            evidence_with_labels(&["Profile"]),
        ];
        for split in 0..=pool.len() {
            let smaller = evaluate(&plan, &pool[..split], &CoverageReport::default(), &classifier, limits());
            let larger = evaluate(&plan, &pool, &CoverageReport::default(), &classifier, limits());
            assert!(
                smaller.completed.is_subset(&larger.completed),
                "prefix {split} completed {:?} not subset of {:?}",
                smaller.completed,
                larger.completed
            );
        }
    }

    #[test]
    fn completed_flows_in_plan_stay_completed_without_new_matches() {
        let mut plan = two_flow_plan();
        plan.sections[0].flows[0].status = FlowStatus::Completed;
        let evidence = vec![evidence_for("home", &["Unrelated"])];
        let report = evaluate(&plan, &evidence, &CoverageReport::default(), &KeywordClassifier, limits());
        assert!(report.completed.contains("home"));
        assert_eq!(report.matched_evidence.get("home"), Some(&0));
    }

    /// Keyword classifier that records which flows it was asked about.
    #[derive(Default)]
    struct CountingClassifier {
        asked: RefCell<Vec<String>>,
    }

    impl CountingClassifier {
        fn asked_for(&self, flow: &str) -> usize {
            self.asked.borrow().iter().filter(|id| *id == flow).count()
        }
    }

    impl Classifier for CountingClassifier {
        fn classify(&self, evidence: &Evidence, flow: &Flow, deadline: Instant) -> Classification {
            self.asked.borrow_mut().push(flow.id.clone());
            KeywordClassifier.classify(evidence, flow, deadline)
        }
    }

    #[test]
    fn completed_flows_keep_prior_index_and_skip_classification() {
        let mut plan = two_flow_plan();
        plan.sections[0].flows[0].status = FlowStatus::Completed;
        let evidence = vec![
            evidence_for("settings", &["Home"]),
            evidence_with_labels(&["Home"]),
        ];
        let mut prior = CoverageReport::default();
        prior.matched_evidence.insert("home".to_string(), 1);
        let classifier = CountingClassifier::default();

        let report = evaluate(&plan, &evidence, &prior, &classifier, limits());

        assert_eq!(report.matched_evidence.get("home"), Some(&1));
        assert_eq!(classifier.asked_for("home"), 0);
        assert_eq!(classifier.asked_for("settings"), 2);
    }

    #[test]
    fn expired_deadline_classifies_nothing() {
        let plan = two_flow_plan();
        let evidence = vec![evidence_with_labels(&["Home"])];
        let classifier = CountingClassifier::default();
        let expired = EvalLimits {
            min_confidence: 0.5,
            deadline: Instant::now(),
        };

        let report = evaluate(&plan, &evidence, &CoverageReport::default(), &classifier, expired);

        assert!(report.completed.is_empty());
        assert!(classifier.asked.borrow().is_empty());
    }

    #[test]
    fn threshold_is_applied_to_keyword_candidates() {
        let mut target = flow_after("notify", &[]);
        target.description = "Notification settings and sounds".to_string();
        let plan = plan_with_sections(vec![section("Main", vec![target])]);
        let evidence = vec![evidence_with_labels(&["Notification"])];
        let prior = CoverageReport::default();

        let lenient = EvalLimits {
            min_confidence: 0.3,
            ..limits()
        };
        assert!(
            evaluate(&plan, &evidence, &prior, &KeywordClassifier, lenient)
                .completed
                .contains("notify")
        );
        assert!(
            evaluate(&plan, &evidence, &prior, &KeywordClassifier, limits())
                .completed
                .is_empty()
        );
    }

    #[test]
    fn blocked_flow_clears_achievable_and_marks_dependents_unreachable() {
        let plan = plan_with_sections(vec![section(
            "Main",
            vec![
                flow_with_status("login", FlowStatus::Blocked),
                flow_after("profile", &["login"]),
            ],
        )]);
        let report = evaluate(&plan, &[], &CoverageReport::default(), &KeywordClassifier, limits());
        assert!(!report.plan_is_achievable);
        assert_eq!(report.blocked.len(), 1);
        assert!(report.unreachable.contains("profile"));
        assert_eq!(report.completion_ratio, 0.0);
        assert!(report.feedback.contains("Unreachable: login, profile"));
    }

    #[test]
    fn waived_blocked_flows_count_toward_ratio() {
        let mut plan = plan_with_sections(vec![section(
            "Main",
            vec![
                flow_with_status("a", FlowStatus::Blocked),
                flow_with_status("b", FlowStatus::Completed),
            ],
        )]);
        plan.sections[0].flows[0].waived = true;
        let evidence = vec![evidence_for("b", &["B"])];
        let report = evaluate(&plan, &evidence, &CoverageReport::default(), &KeywordClassifier, limits());
        assert_eq!(report.completion_ratio, 1.0);
        assert!(report.plan_is_achievable);
        assert!(report.is_complete());
    }

    #[test]
    fn regressions_are_detected() {
        let mut prev = CoverageReport::default();
        prev.completed.insert("a".to_string());
        prev.completed.insert("b".to_string());
        let mut next = CoverageReport::default();
        next.completed.insert("a".to_string());

        let regressions = find_regressions(&prev, &next);
        assert_eq!(regressions, vec!["flow 'b' was completed and is no longer".to_string()]);
        assert!(find_regressions(&next, &prev).is_empty());
    }
}
