//! Session-level scenarios driven through the orchestrator and the registry.
//!
//! Scripted collaborators pin down the explorer's behavior; the app-map
//! scenarios run the real explorer, heuristic navigator, outline planner and
//! keyword classifier against an offline device.

use std::collections::BTreeSet;
use std::fs;

use screencrawl::core::budget::Budget;
use screencrawl::core::classifier::KeywordClassifier;
use screencrawl::core::machine::NO_REACHABLE_FLOWS;
use screencrawl::core::types::{FailureKind, FlowStatus, SessionStatus};
use screencrawl::error::{CrawlError, CrawlResult};
use screencrawl::explore::DeviceExplorer;
use screencrawl::explore::navigator::HeuristicNavigator;
use screencrawl::io::app_map::{AppMap, AppMapDevice};
use screencrawl::io::session_store::{SessionRecord, SessionStore};
use screencrawl::manager::{CancelToken, LoopPolicy, Orchestrator, SessionOutcome, SessionState};
use screencrawl::planner::OutlinePlanBuilder;
use screencrawl::sessions::{Collaborators, SessionRegistry};
use screencrawl::test_support::{
    ScriptedExplorer, ScriptedPlanner, ScriptedStep, expect_flow, flow, plan_with_sections,
    section,
};
use tempfile::TempDir;

fn two_flow_plan() -> screencrawl::core::plan::CoveragePlan {
    plan_with_sections(vec![section(
        "Main",
        vec![expect_flow("home", &["Home"]), expect_flow("cart", &["Cart"])],
    )])
}

fn run_scripted(
    temp: &TempDir,
    plan: screencrawl::core::plan::CoveragePlan,
    script: Vec<ScriptedStep>,
    budget: Budget,
    policy: LoopPolicy,
    mut on_iteration: impl FnMut(&SessionState),
) -> SessionOutcome {
    let mut orchestrator = Orchestrator::new(
        ScriptedPlanner::new(plan),
        ScriptedExplorer::new(script),
        KeywordClassifier::default(),
        SessionStore::new(temp.path().join("artifacts")),
        budget,
        policy,
    );
    let state = orchestrator
        .prepare("session-1", "com.example.shop", "- Home\n- Cart")
        .expect("plan");
    orchestrator.run(state, &CancelToken::new(), |state| on_iteration(state))
}

fn load_record(outcome: &SessionOutcome) -> SessionRecord {
    let path = outcome.record_path.as_ref().expect("record path");
    serde_json::from_str(&fs::read_to_string(path).expect("read record")).expect("parse record")
}

#[test]
fn advancing_both_flows_completes_in_two_iterations() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outcome = run_scripted(
        &temp,
        two_flow_plan(),
        vec![ScriptedStep::advance(&["Home"]), ScriptedStep::advance(&["Cart"])],
        Budget::default(),
        LoopPolicy::default(),
        |_| {},
    );

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.iterations, 2);
    assert_eq!(outcome.report.completion_ratio, 1.0);
    assert!(outcome.reason.is_none());

    let record = load_record(&outcome);
    assert_eq!(record.status, SessionStatus::Completed);
    assert_eq!(record.evidence.len(), 2);
    assert_eq!(record.report.matched_evidence.get("home"), Some(&0));
    assert_eq!(record.report.matched_evidence.get("cart"), Some(&1));
    for evidence in &record.evidence {
        let source = evidence.page_source.as_deref().expect("page source path");
        assert!(fs::metadata(source).expect("stored page source").is_file());
    }
    let session_dir = outcome
        .record_path
        .as_ref()
        .and_then(|path| path.parent())
        .expect("session dir");
    assert!(session_dir.join("screenshots").is_dir());
    assert!(session_dir.join("iterations/1/meta.json").is_file());
    assert!(session_dir.join("iterations/2/report.json").is_file());
}

#[test]
fn repeated_failures_block_the_only_flow_and_exhaust() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = plan_with_sections(vec![section("Main", vec![expect_flow("login", &["Login"])])]);
    let outcome = run_scripted(
        &temp,
        plan,
        vec![ScriptedStep::Fail(FailureKind::Target); 3],
        Budget::default(),
        LoopPolicy::default(),
        |_| {},
    );

    assert_eq!(outcome.status, SessionStatus::Exhausted);
    assert_eq!(outcome.reason.as_deref(), Some(NO_REACHABLE_FLOWS));
    assert_eq!(outcome.report.completion_ratio, 0.0);
    assert!(!outcome.report.plan_is_achievable);
    assert_eq!(
        outcome.plan.flow("login").map(|f| f.status),
        Some(FlowStatus::Blocked)
    );
    assert_eq!(
        load_record(&outcome).replanned_sections,
        vec!["Main".to_string()]
    );
}

#[test]
fn single_iteration_budget_leaves_second_flow_untouched() {
    let temp = tempfile::tempdir().expect("tempdir");
    let outcome = run_scripted(
        &temp,
        plan_with_sections(vec![section("Main", vec![flow("first"), flow("second")])]),
        Vec::new(),
        Budget {
            max_iterations: 1,
            ..Budget::default()
        },
        LoopPolicy::default(),
        |_| {},
    );

    assert_eq!(outcome.status, SessionStatus::Exhausted);
    assert_eq!(outcome.iterations, 1);
    assert!(outcome.reason.expect("reason").contains("iteration budget"));
    let untouched: Vec<&str> = outcome
        .plan
        .flows()
        .filter(|f| f.status == FlowStatus::Pending)
        .map(|f| f.id.as_str())
        .collect();
    assert_eq!(untouched, vec!["second"]);
}

#[test]
fn empty_description_fails_before_anything_is_persisted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let artifacts = temp.path().join("artifacts");
    let registry = SessionRegistry::new(
        |_app_id: &str| -> CrawlResult<Collaborators> {
            Ok(Collaborators {
                planner: Box::new(OutlinePlanBuilder),
                explorer: Box::new(ScriptedExplorer::new(Vec::new())),
                classifier: Box::new(KeywordClassifier::default()),
            })
        },
        SessionStore::new(&artifacts),
        LoopPolicy::default(),
    );

    let err = registry
        .start_session("com.example.shop", "", Budget::default())
        .unwrap_err();
    assert!(matches!(err, CrawlError::PlanGeneration(_)));
    assert!(registry.live_sessions().is_empty());
    assert!(!artifacts.exists());
}

#[test]
fn every_script_terminates_within_the_iteration_budget() {
    let scripts = [
        vec![ScriptedStep::NoProgress; 30],
        vec![ScriptedStep::Fail(FailureKind::Timeout); 30],
        (0..30)
            .map(|i| {
                if i % 2 == 0 {
                    ScriptedStep::NoProgress
                } else {
                    ScriptedStep::advance(&["Elsewhere"])
                }
            })
            .collect(),
    ];
    for script in scripts {
        let temp = tempfile::tempdir().expect("tempdir");
        let plan = plan_with_sections(vec![
            section("Main", vec![expect_flow("a", &["A"]), expect_flow("b", &["B"])]),
            section("More", vec![expect_flow("c", &["C"])]),
        ]);
        let outcome = run_scripted(
            &temp,
            plan,
            script,
            Budget {
                max_iterations: 7,
                ..Budget::default()
            },
            LoopPolicy::default(),
            |_| {},
        );
        assert!(outcome.iterations <= 7, "ran {} iterations", outcome.iterations);
        assert!(outcome.status.is_terminal());
        assert!(outcome.record_path.is_some());
    }
}

#[test]
fn exactly_threshold_consecutive_stalls_block_a_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut statuses = Vec::new();
    let outcome = run_scripted(
        &temp,
        plan_with_sections(vec![section("Main", vec![flow("a"), flow("b")])]),
        vec![ScriptedStep::NoProgress; 4],
        Budget {
            max_iterations: 4,
            ..Budget::default()
        },
        LoopPolicy {
            stall_threshold: 4,
            ..LoopPolicy::default()
        },
        |state| statuses.push(state.plan.flow("a").map(|f| f.status)),
    );

    assert_eq!(
        statuses,
        vec![
            Some(FlowStatus::InProgress),
            Some(FlowStatus::InProgress),
            Some(FlowStatus::InProgress),
            Some(FlowStatus::Blocked),
        ]
    );
    assert_eq!(outcome.status, SessionStatus::Exhausted);
}

#[test]
fn completed_flows_never_regress() {
    let temp = tempfile::tempdir().expect("tempdir");
    let plan = plan_with_sections(vec![section(
        "Main",
        vec![
            expect_flow("a", &["A"]),
            expect_flow("b", &["B"]),
            expect_flow("c", &["C"]),
        ],
    )]);
    let mut completed_so_far = BTreeSet::new();
    let outcome = run_scripted(
        &temp,
        plan,
        vec![
            ScriptedStep::advance(&["A"]),
            ScriptedStep::NoProgress,
            ScriptedStep::advance(&["B"]),
            ScriptedStep::Fail(FailureKind::Target),
            ScriptedStep::advance(&["C"]),
        ],
        Budget::default(),
        LoopPolicy::default(),
        |state| {
            let now: BTreeSet<String> = state
                .plan
                .flows()
                .filter(|f| f.status == FlowStatus::Completed)
                .map(|f| f.id.clone())
                .collect();
            assert!(now.is_superset(&completed_so_far));
            assert!(now.is_subset(&state.report.completed));
            completed_so_far = now;
        },
    );
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.iterations, 5);
}

fn shop_map() -> AppMap {
    serde_json::from_value(serde_json::json!({
        "start": "home",
        "screens": {
            "home": {
                "title": "Home",
                "elements": ["Settings", "Cart"],
                "taps": { "Settings": "settings", "Cart": "cart" }
            },
            "settings": {
                "title": "Settings",
                "elements": ["Back", "Notifications"],
                "taps": { "Back": "home" }
            },
            "cart": {
                "title": "Cart",
                "elements": ["Checkout", "Back"],
                "taps": { "Back": "home" }
            }
        }
    }))
    .expect("app map")
}

fn map_registry(
    artifacts: &std::path::Path,
    map: AppMap,
) -> SessionRegistry<impl Fn(&str) -> CrawlResult<Collaborators>> {
    SessionRegistry::new(
        move |_app_id: &str| -> CrawlResult<Collaborators> {
            Ok(Collaborators {
                planner: Box::new(OutlinePlanBuilder),
                explorer: Box::new(DeviceExplorer::new(
                    AppMapDevice::new(map.clone()),
                    HeuristicNavigator::new(),
                    30,
                )),
                classifier: Box::new(KeywordClassifier::default()),
            })
        },
        SessionStore::new(artifacts),
        LoopPolicy::default(),
    )
}

const SHOP_DESCRIPTION: &str = "\
# Main
- Home screen [expect: Home]
- Settings screen [expect: Notifications]
- Cart screen [expect: Checkout]
";

#[test]
fn app_map_session_reaches_every_screen() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = map_registry(temp.path(), shop_map());
    let id = registry
        .start_session("com.example.shop", SHOP_DESCRIPTION, Budget::default())
        .expect("start");
    let outcome = registry.wait(&id).expect("wait");

    assert_eq!(outcome.status, SessionStatus::Completed);
    assert!(outcome.plan.flows().all(|f| f.status == FlowStatus::Completed));
    let record = load_record(&outcome);
    assert_eq!(record.evidence.len(), 3);
    assert!(record.evidence.iter().all(|e| e.screenshot.starts_with("appmap://")));
    let status = registry.get_status(&id).expect("status");
    assert_eq!(status.completion_ratio, 1.0);
}

#[test]
fn unreachable_device_fails_after_transport_errors_on_two_flows() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut map = shop_map();
    map.unreachable = true;
    let registry = map_registry(temp.path(), map);
    let id = registry
        .start_session("com.example.shop", SHOP_DESCRIPTION, Budget::default())
        .expect("start");
    let outcome = registry.wait(&id).expect("wait");

    assert_eq!(outcome.status, SessionStatus::Failed);
    assert!(
        outcome
            .reason
            .as_deref()
            .expect("reason")
            .starts_with("device transport failed on 2 flows")
    );
    assert_eq!(outcome.report.completion_ratio, 0.0);
    assert!(outcome.record_path.is_some());
}
