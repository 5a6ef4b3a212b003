//! Explorer: drives the device toward the next unmet flow and gathers evidence.
//!
//! One call to [`Explorer::step`] is one orchestrator iteration. The explorer
//! never mutates the plan; it returns captures and an outcome tag and the
//! orchestrator folds them into session state.

pub mod navigator;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::fingerprint::{Fingerprint, extract_labels};
use crate::core::plan::{CoveragePlan, Flow};
use crate::core::selector::next_flow;
use crate::core::types::{CoverageReport, Evidence, FailureKind, StepOutcome};
use crate::io::device::{ActionCapability, DeviceAction, DeviceError, perform};

use self::navigator::{NavigationRequest, Navigator};

/// Read-only view of session state handed to the explorer.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub app_id: &'a str,
    pub plan: &'a CoveragePlan,
    pub evidence: &'a [Evidence],
    pub report: Option<&'a CoverageReport>,
    pub iteration: u32,
}

/// A new screen: evidence plus the raw page source it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub evidence: Evidence,
    pub page_source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    fn from_device(err: &DeviceError) -> Self {
        let kind = match err {
            DeviceError::Transport(_) => FailureKind::Transport,
            DeviceError::Target(_) => FailureKind::Target,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }

    fn timeout() -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: "step deadline expired".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExplorationResult {
    /// Flow the step worked on; `None` when nothing was eligible.
    pub flow_id: Option<String>,
    pub captures: Vec<Capture>,
    pub outcome: StepOutcome,
    pub failure: Option<StepFailure>,
    /// Navigation actions attempted, in order.
    pub actions: Vec<DeviceAction>,
    /// Primitive device calls spent, retries included.
    pub device_calls: u32,
}

impl ExplorationResult {
    pub fn idle() -> Self {
        Self {
            flow_id: None,
            captures: Vec::new(),
            outcome: StepOutcome::NoProgress,
            failure: None,
            actions: Vec::new(),
            device_calls: 0,
        }
    }
}

/// One exploration step per call.
pub trait Explorer {
    fn step(&mut self, view: &SessionView<'_>, deadline: Instant) -> ExplorationResult;

    /// Release the device. Called exactly once, when the session ends.
    fn finish(&mut self) -> Result<(), DeviceError>;
}

impl<X: Explorer + ?Sized> Explorer for Box<X> {
    fn step(&mut self, view: &SessionView<'_>, deadline: Instant) -> ExplorationResult {
        (**self).step(view, deadline)
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        (**self).finish()
    }
}

/// Explorer over an [`ActionCapability`], with navigation delegated to a
/// [`Navigator`].
///
/// Per step: launch the app if needed, observe the current screen, then run
/// the navigator's proposal, observing after every action. Each primitive is
/// retried once; a second failure ends the step `action_failed`. The deadline
/// is checked before every primitive and the turn budget caps primitive calls.
pub struct DeviceExplorer<D, N> {
    device: D,
    navigator: N,
    turn_budget: u32,
    launched: bool,
    seen: HashSet<Fingerprint>,
    attempts: HashMap<String, u32>,
}

impl<D: ActionCapability, N: Navigator> DeviceExplorer<D, N> {
    pub fn new(device: D, navigator: N, turn_budget: u32) -> Self {
        Self {
            device,
            navigator,
            turn_budget: turn_budget.max(1),
            launched: false,
            seen: HashSet::new(),
            attempts: HashMap::new(),
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn observe(
        &mut self,
        turn: &mut Turn,
        flow: &Flow,
        captures: &mut Vec<Capture>,
    ) -> Result<Screen, TurnStop> {
        let source = turn.call(&mut self.device, "get_page_source", |d| d.get_page_source())?;
        let fingerprint = Fingerprint::of(&source);
        let labels = extract_labels(&source);

        if !self.seen.contains(&fingerprint) {
            let screenshot =
                turn.call(&mut self.device, "capture_screenshot", |d| d.capture_screenshot())?;
            self.seen.insert(fingerprint.clone());
            debug!(fingerprint = %fingerprint.short(), flow = %flow.id, "captured new screen");
            captures.push(Capture {
                evidence: Evidence {
                    captured_at: Utc::now(),
                    fingerprint: fingerprint.clone(),
                    screenshot,
                    page_source: None,
                    labels: labels.clone(),
                    flow_id: Some(flow.id.clone()),
                },
                page_source: source.clone(),
            });
        }

        Ok(Screen {
            source,
            fingerprint,
            labels,
        })
    }

    fn run_turn(
        &mut self,
        view: &SessionView<'_>,
        flow: &Flow,
        turn: &mut Turn,
        captures: &mut Vec<Capture>,
        actions: &mut Vec<DeviceAction>,
    ) -> Result<(), TurnStop> {
        if !self.launched {
            turn.call(&mut self.device, "launch_app", |d| d.launch_app(view.app_id))?;
            self.launched = true;
            info!(app_id = view.app_id, "app launched");
        }

        let mut screen = self.observe(turn, flow, captures)?;
        let attempt = self.attempts.get(&flow.id).copied().unwrap_or(0);
        let request = NavigationRequest {
            app_id: view.app_id,
            flow,
            page_source: &screen.source,
            labels: &screen.labels,
            fingerprint: &screen.fingerprint,
            attempt,
            feedback: view.report.map(|report| report.feedback.as_str()),
            deadline: turn.deadline,
        };
        let proposal = match self.navigator.propose(&request) {
            Ok(proposal) => proposal,
            Err(err) => {
                warn!(flow = %flow.id, err = %err, "navigator failed");
                Vec::new()
            }
        };

        for action in proposal {
            actions.push(action.clone());
            turn.call(&mut self.device, "perform", |d| perform(d, &action))?;
            screen = self.observe(turn, flow, captures)?;
        }
        debug!(flow = %flow.id, screen = %screen.fingerprint.short(), "turn finished");
        Ok(())
    }
}

impl<D: ActionCapability, N: Navigator> Explorer for DeviceExplorer<D, N> {
    #[instrument(skip_all, fields(iteration = view.iteration))]
    fn step(&mut self, view: &SessionView<'_>, deadline: Instant) -> ExplorationResult {
        self.seen
            .extend(view.evidence.iter().map(|item| item.fingerprint.clone()));

        let Some(flow) = next_flow(view.plan) else {
            debug!("no eligible flow");
            return ExplorationResult::idle();
        };

        let mut turn = Turn {
            deadline,
            budget: self.turn_budget,
            calls: 0,
        };
        let mut captures = Vec::new();
        let mut actions = Vec::new();
        let stop = self
            .run_turn(view, flow, &mut turn, &mut captures, &mut actions)
            .err();
        *self.attempts.entry(flow.id.clone()).or_insert(0) += 1;

        let failure = match stop {
            Some(TurnStop::Failed(failure)) => Some(failure),
            Some(TurnStop::Budget) => {
                debug!(budget = self.turn_budget, "turn budget spent");
                None
            }
            None => None,
        };
        let outcome = if failure.is_some() {
            StepOutcome::ActionFailed
        } else if captures.is_empty() {
            StepOutcome::NoProgress
        } else {
            StepOutcome::Advanced
        };
        info!(
            flow = %flow.id,
            outcome = ?outcome,
            captures = captures.len(),
            device_calls = turn.calls,
            "explorer step finished"
        );

        ExplorationResult {
            flow_id: Some(flow.id.clone()),
            captures,
            outcome,
            failure,
            actions,
            device_calls: turn.calls,
        }
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.launched = false;
        self.device.release()
    }
}

struct Screen {
    source: String,
    fingerprint: Fingerprint,
    labels: Vec<String>,
}

enum TurnStop {
    Budget,
    Failed(StepFailure),
}

/// Per-step accounting of primitive calls against the deadline and budget.
struct Turn {
    deadline: Instant,
    budget: u32,
    calls: u32,
}

impl Turn {
    fn call<D, T, F>(&mut self, device: &mut D, what: &str, mut op: F) -> Result<T, TurnStop>
    where
        D: ActionCapability + ?Sized,
        F: FnMut(&mut D) -> Result<T, DeviceError>,
    {
        let mut retried = false;
        loop {
            if Instant::now() >= self.deadline {
                return Err(TurnStop::Failed(StepFailure::timeout()));
            }
            if self.calls >= self.budget {
                return Err(TurnStop::Budget);
            }
            self.calls += 1;
            match op(device) {
                Ok(value) => return Ok(value),
                Err(err) if !retried => {
                    warn!(call = what, err = %err, "device call failed, retrying once");
                    retried = true;
                }
                Err(err) => {
                    warn!(call = what, err = %err, "device call failed twice");
                    return Err(TurnStop::Failed(StepFailure::from_device(&err)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::navigator::HeuristicNavigator;
    use crate::io::app_map::{AppMap, AppMapDevice};
    use crate::test_support::{ScriptedDevice, expect_flow, plan_with_sections, section};
    use std::time::Duration;

    fn settings_map() -> AppMap {
        serde_json::from_str(
            r#"{
                "start": "home",
                "screens": {
                    "home": {"title": "Home", "elements": ["Settings"], "taps": {"Settings": "settings"}},
                    "settings": {"title": "Settings", "elements": ["Dark Mode"]}
                }
            }"#,
        )
        .expect("parse map")
    }

    fn view<'a>(plan: &'a CoveragePlan, evidence: &'a [Evidence]) -> SessionView<'a> {
        SessionView {
            app_id: "com.example",
            plan,
            evidence,
            report: None,
            iteration: 1,
        }
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[test]
    fn first_step_launches_and_captures_new_screens() {
        let plan = plan_with_sections(vec![section(
            "Main",
            vec![expect_flow("settings", &["Settings", "Dark Mode"])],
        )]);
        let mut explorer = DeviceExplorer::new(
            AppMapDevice::new(settings_map()),
            HeuristicNavigator::new(),
            30,
        );

        let result = explorer.step(&view(&plan, &[]), soon());
        assert_eq!(result.outcome, StepOutcome::Advanced);
        assert_eq!(result.flow_id.as_deref(), Some("settings"));
        assert_eq!(result.captures.len(), 2);
        assert!(result.captures[1].evidence.labels.contains(&"Dark Mode".to_string()));
        assert_eq!(explorer.device().current_screen(), Some("settings"));
        // launch, source, screenshot, tap, source, screenshot
        assert_eq!(result.device_calls, 6);
    }

    #[test]
    fn known_screens_yield_no_progress() {
        let plan = plan_with_sections(vec![section("Main", vec![expect_flow("x", &["Nowhere"])])]);
        let map: AppMap = serde_json::from_str(
            r#"{"start":"home","screens":{"home":{"title":"Home"}}}"#,
        )
        .expect("parse map");
        let mut explorer = DeviceExplorer::new(AppMapDevice::new(map), HeuristicNavigator::new(), 30);

        let first = explorer.step(&view(&plan, &[]), soon());
        assert_eq!(first.outcome, StepOutcome::Advanced);
        let evidence: Vec<Evidence> = first.captures.into_iter().map(|c| c.evidence).collect();

        let second = explorer.step(&view(&plan, &evidence), soon());
        assert_eq!(second.outcome, StepOutcome::NoProgress);
        assert!(second.captures.is_empty());
    }

    #[test]
    fn failing_primitive_is_retried_once_then_fails_the_step() {
        let plan = plan_with_sections(vec![section("Main", vec![expect_flow("x", &["X"])])]);
        let device = ScriptedDevice::failing(DeviceError::Transport("offline".to_string()));
        let mut explorer = DeviceExplorer::new(device, HeuristicNavigator::new(), 30);

        let result = explorer.step(&view(&plan, &[]), soon());
        assert_eq!(result.outcome, StepOutcome::ActionFailed);
        let failure = result.failure.expect("failure");
        assert_eq!(failure.kind, FailureKind::Transport);
        assert_eq!(result.device_calls, 2);
    }

    #[test]
    fn expired_deadline_fails_with_timeout() {
        let plan = plan_with_sections(vec![section("Main", vec![expect_flow("x", &["X"])])]);
        let mut explorer = DeviceExplorer::new(
            AppMapDevice::new(settings_map()),
            HeuristicNavigator::new(),
            30,
        );
        let result = explorer.step(&view(&plan, &[]), Instant::now());
        assert_eq!(result.outcome, StepOutcome::ActionFailed);
        assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::Timeout));
        assert_eq!(result.device_calls, 0);
    }

    #[test]
    fn turn_budget_caps_primitive_calls() {
        let plan = plan_with_sections(vec![section(
            "Main",
            vec![expect_flow("settings", &["Settings"])],
        )]);
        let mut explorer = DeviceExplorer::new(
            AppMapDevice::new(settings_map()),
            HeuristicNavigator::new(),
            2,
        );
        let result = explorer.step(&view(&plan, &[]), soon());
        assert_eq!(result.device_calls, 2);
        assert_eq!(result.outcome, StepOutcome::NoProgress);
        assert!(result.failure.is_none());
    }

    #[test]
    fn no_eligible_flow_is_idle_and_finish_releases_device() {
        let mut plan = plan_with_sections(vec![section("Main", vec![expect_flow("a", &["A"])])]);
        plan.sections[0].flows[0].status = crate::core::types::FlowStatus::Blocked;
        let mut explorer = DeviceExplorer::new(
            AppMapDevice::new(settings_map()),
            HeuristicNavigator::new(),
            30,
        );
        assert_eq!(explorer.step(&view(&plan, &[]), soon()), ExplorationResult::idle());
        explorer.finish().expect("release");
        assert!(explorer.device().is_released());
    }
}
