//! Test-only builders and scripted collaborators.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use quick_xml::escape::escape;

use crate::core::evaluator::EvalLimits;
use crate::core::fingerprint::{Fingerprint, extract_labels};
use crate::core::plan::{CoveragePlan, Flow, Section};
use crate::core::selector::next_flow;
use crate::core::types::{Evidence, FailureKind, FlowStatus, StepOutcome};
use crate::error::{CrawlError, CrawlResult};
use crate::explore::{Capture, ExplorationResult, Explorer, SessionView, StepFailure};
use crate::io::device::{ActionCapability, DeviceError, Locator, PhysicalButton, SwipeDirection};
use crate::planner::{PlanBuilder, RevisionRequest};

/// Deadline no test reaches.
pub fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

/// Evaluation limits with the default threshold and no effective deadline.
pub fn limits() -> EvalLimits {
    EvalLimits {
        min_confidence: 0.5,
        deadline: far_deadline(),
    }
}

/// Pending flow with description `"<id> description"`.
pub fn flow(id: &str) -> Flow {
    Flow::new(id, format!("{id} description"))
}

pub fn flow_after(id: &str, prerequisites: &[&str]) -> Flow {
    let mut flow = flow(id);
    flow.prerequisites = prerequisites.iter().map(|p| p.to_string()).collect();
    flow
}

pub fn flow_with_status(id: &str, status: FlowStatus) -> Flow {
    let mut flow = flow(id);
    flow.status = status;
    flow
}

/// Flow identified by the joint presence of `labels`.
pub fn expect_flow(id: &str, labels: &[&str]) -> Flow {
    let mut flow = flow(id);
    flow.expect = labels.iter().map(|l| l.to_string()).collect();
    flow
}

pub fn section(name: &str, flows: Vec<Flow>) -> Section {
    Section {
        name: name.to_string(),
        description: String::new(),
        flows,
    }
}

pub fn plan_with_sections(sections: Vec<Section>) -> CoveragePlan {
    CoveragePlan {
        id: "test-coverage".to_string(),
        app_id: "com.example.app".to_string(),
        sections,
        success_criteria: Vec::new(),
    }
}

/// Page source listing `labels` as buttons.
pub fn page_source_with_labels(labels: &[&str]) -> String {
    let mut xml = String::from("<hierarchy>");
    for label in labels {
        xml.push_str(&format!("<Button label=\"{}\"/>", escape(*label)));
    }
    xml.push_str("</hierarchy>");
    xml
}

/// Evidence attributed to `flow_id`, showing `labels`.
pub fn evidence_for(flow_id: &str, labels: &[&str]) -> Evidence {
    Evidence {
        flow_id: Some(flow_id.to_string()),
        ..evidence_with_labels(labels)
    }
}

/// Unattributed evidence showing `labels`.
pub fn evidence_with_labels(labels: &[&str]) -> Evidence {
    let source = page_source_with_labels(labels);
    let fingerprint = Fingerprint::of(&source);
    Evidence {
        captured_at: Utc::now(),
        screenshot: format!("shot://{}", fingerprint.short()),
        fingerprint,
        page_source: None,
        labels: labels.iter().map(|l| l.to_string()).collect(),
        flow_id: None,
    }
}

/// Device whose every call fails with the same error.
#[derive(Debug)]
pub struct ScriptedDevice {
    error: DeviceError,
    pub calls: u32,
    pub released: bool,
}

impl ScriptedDevice {
    pub fn failing(error: DeviceError) -> Self {
        Self {
            error,
            calls: 0,
            released: false,
        }
    }

    fn fail<T>(&mut self) -> Result<T, DeviceError> {
        self.calls += 1;
        Err(self.error.clone())
    }
}

impl ActionCapability for ScriptedDevice {
    fn launch_app(&mut self, _app_id: &str) -> Result<(), DeviceError> {
        self.fail()
    }
    fn tap(&mut self, _locator: &Locator) -> Result<(), DeviceError> {
        self.fail()
    }
    fn swipe(&mut self, _direction: SwipeDirection) -> Result<(), DeviceError> {
        self.fail()
    }
    fn type_text(&mut self, _locator: &Locator, _text: &str) -> Result<(), DeviceError> {
        self.fail()
    }
    fn navigate(&mut self, _url: &str) -> Result<(), DeviceError> {
        self.fail()
    }
    fn press_button(&mut self, _button: PhysicalButton) -> Result<(), DeviceError> {
        self.fail()
    }
    fn get_page_source(&mut self) -> Result<String, DeviceError> {
        self.fail()
    }
    fn capture_screenshot(&mut self) -> Result<String, DeviceError> {
        self.fail()
    }
    fn release(&mut self) -> Result<(), DeviceError> {
        self.released = true;
        Ok(())
    }
}

/// One scripted explorer step, applied to the flow the plan selects next.
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Capture one new screen showing these labels.
    Advance(Vec<String>),
    NoProgress,
    Fail(FailureKind),
}

impl ScriptedStep {
    pub fn advance(labels: &[&str]) -> Self {
        ScriptedStep::Advance(labels.iter().map(|l| l.to_string()).collect())
    }
}

/// Shared observations of a [`ScriptedExplorer`] after it moved into a session.
#[derive(Debug, Clone, Default)]
pub struct ExplorerWatch {
    steps: Arc<AtomicU32>,
    finished: Arc<AtomicBool>,
}

impl ExplorerWatch {
    pub fn steps(&self) -> u32 {
        self.steps.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Explorer replaying scripted steps; once the script runs out every step
/// is `NoProgress`.
#[derive(Debug)]
pub struct ScriptedExplorer {
    script: VecDeque<ScriptedStep>,
    watch: ExplorerWatch,
    captured: u32,
}

impl ScriptedExplorer {
    pub fn new(script: Vec<ScriptedStep>) -> Self {
        Self {
            script: script.into(),
            watch: ExplorerWatch::default(),
            captured: 0,
        }
    }

    pub fn watch(&self) -> ExplorerWatch {
        self.watch.clone()
    }
}

impl Explorer for ScriptedExplorer {
    fn step(&mut self, view: &SessionView<'_>, _deadline: Instant) -> ExplorationResult {
        self.watch.steps.fetch_add(1, Ordering::SeqCst);
        let Some(flow) = next_flow(view.plan) else {
            return ExplorationResult::idle();
        };
        let mut result = ExplorationResult {
            flow_id: Some(flow.id.clone()),
            ..ExplorationResult::idle()
        };
        match self.script.pop_front().unwrap_or(ScriptedStep::NoProgress) {
            ScriptedStep::Advance(labels) => {
                self.captured += 1;
                let mut source = String::from("<hierarchy>");
                source.push_str(&format!("<StaticText label=\"screen {}\"/>", self.captured));
                for label in &labels {
                    source.push_str(&format!("<Button label=\"{}\"/>", escape(label.as_str())));
                }
                source.push_str("</hierarchy>");
                let fingerprint = Fingerprint::of(&source);
                result.captures.push(Capture {
                    evidence: Evidence {
                        captured_at: Utc::now(),
                        screenshot: format!("shot://{}", fingerprint.short()),
                        fingerprint,
                        page_source: None,
                        labels: extract_labels(&source),
                        flow_id: Some(flow.id.clone()),
                    },
                    page_source: source,
                });
                result.outcome = StepOutcome::Advanced;
                result.device_calls = 3;
            }
            ScriptedStep::NoProgress => {
                result.device_calls = 1;
            }
            ScriptedStep::Fail(kind) => {
                result.outcome = StepOutcome::ActionFailed;
                result.failure = Some(StepFailure {
                    kind,
                    message: format!("scripted {kind:?} failure"),
                });
                result.device_calls = 2;
            }
        }
        result
    }

    fn finish(&mut self) -> Result<(), DeviceError> {
        self.watch.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Plan builder returning a fixed plan; revisions are replayed from a queue
/// and fall back to the unchanged section.
#[derive(Debug)]
pub struct ScriptedPlanner {
    plan: Result<CoveragePlan, String>,
    revisions: VecDeque<CrawlResult<Section>>,
    pub revise_calls: u32,
}

impl ScriptedPlanner {
    pub fn new(plan: CoveragePlan) -> Self {
        Self {
            plan: Ok(plan),
            revisions: VecDeque::new(),
            revise_calls: 0,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            plan: Err(message.to_string()),
            revisions: VecDeque::new(),
            revise_calls: 0,
        }
    }

    pub fn with_revision(mut self, revision: CrawlResult<Section>) -> Self {
        self.revisions.push_back(revision);
        self
    }
}

impl PlanBuilder for ScriptedPlanner {
    fn build(&mut self, app_id: &str, description: &str) -> CrawlResult<CoveragePlan> {
        if description.trim().is_empty() {
            return Err(CrawlError::PlanGeneration(
                "app description is empty".to_string(),
            ));
        }
        match &self.plan {
            Ok(plan) => Ok(CoveragePlan {
                app_id: app_id.to_string(),
                ..plan.clone()
            }),
            Err(message) => Err(CrawlError::PlanGeneration(message.clone())),
        }
    }

    fn revise(&mut self, request: &RevisionRequest<'_>) -> CrawlResult<Section> {
        self.revise_calls += 1;
        if let Some(revision) = self.revisions.pop_front() {
            return revision;
        }
        request
            .plan
            .section(request.section)
            .cloned()
            .ok_or_else(|| CrawlError::PlanGeneration(format!("unknown section '{}'", request.section)))
    }
}
