//! Orchestrator: the explore / evaluate / decide loop for one session.
//!
//! The orchestrator owns [`SessionState`]. Each iteration runs one explorer
//! step, stores its captures, folds the outcome into the plan (in progress,
//! blocked after repeated stalls), evaluates coverage and decides the next
//! phase with [`decide`]. Replanning revises one section through the plan
//! builder and merges the result. Every path ends in a persisted terminal
//! record and a released device.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::core::budget::Budget;
use crate::core::classifier::Classifier;
use crate::core::evaluator::{EvalLimits, evaluate, find_regressions};
use crate::core::immutability::check_plan_amendment;
use crate::core::invariants::{validate_completed_flows, validate_plan};
use crate::core::machine::{Decision, decide};
use crate::core::plan::CoveragePlan;
use crate::core::stall::StallTracker;
use crate::core::state_update::{
    apply_report, mark_blocked, mark_in_progress, merge_section, waive_blocked,
};
use crate::core::types::{
    CoverageReport, Evidence, FailureKind, Phase, PlanUpdateSummary, SessionStatus,
};
use crate::error::CrawlError;
use crate::explore::{ExplorationResult, Explorer, SessionView};
use crate::io::iteration_log::IterationMeta;
use crate::io::session_store::{SessionRecord, SessionStore};
use crate::planner::{PlanBuilder, RevisionRequest};

pub const CANCELLED: &str = "cancelled";

/// Loop knobs beyond the iteration and time budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoopPolicy {
    /// Primitive device calls allowed per explorer step.
    pub turn_budget: u32,
    pub stall_threshold: u32,
    /// Distinct flows with transport failures before the session fails.
    pub transport_failure_limit: u32,
    pub min_confidence: f64,
    pub waive_blocked_after_replan: bool,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            turn_budget: 30,
            stall_threshold: 3,
            transport_failure_limit: 2,
            min_confidence: 0.5,
            waive_blocked_after_replan: false,
        }
    }
}

/// Cooperative cancellation flag, checked at phase boundaries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything the orchestrator knows about a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session_id: String,
    pub app_id: String,
    pub description: String,
    pub plan: CoveragePlan,
    pub evidence: Vec<Evidence>,
    pub iterations: u32,
    pub elapsed: Duration,
    pub report: CoverageReport,
    pub phase: Phase,
    pub reason: Option<String>,
    pub replanned: BTreeSet<String>,
    pub rejected_evaluations: u32,
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(
        session_id: impl Into<String>,
        app_id: impl Into<String>,
        description: impl Into<String>,
        plan: CoveragePlan,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            app_id: app_id.into(),
            description: description.into(),
            plan,
            evidence: Vec::new(),
            iterations: 0,
            elapsed: Duration::ZERO,
            report: CoverageReport::default(),
            phase: Phase::Initializing,
            reason: None,
            replanned: BTreeSet::new(),
            rejected_evaluations: 0,
            started_at: Utc::now(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.phase.status()
    }

    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            app_id: self.app_id.clone(),
            description: self.description.clone(),
            status: self.status(),
            phase: self.phase,
            reason: self.reason.clone(),
            iterations: self.iterations,
            elapsed_ms: u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
            rejected_evaluations: self.rejected_evaluations,
            replanned_sections: self.replanned.iter().cloned().collect(),
            started_at: self.started_at,
            ended_at: Utc::now(),
            plan: self.plan.clone(),
            evidence: self.evidence.clone(),
            report: self.report.clone(),
        }
    }

    fn view(&self) -> SessionView<'_> {
        SessionView {
            app_id: &self.app_id,
            plan: &self.plan,
            evidence: &self.evidence,
            report: Some(&self.report),
            iteration: self.iterations,
        }
    }
}

/// Terminal result handed back to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub reason: Option<String>,
    pub report: CoverageReport,
    pub plan: CoveragePlan,
    pub iterations: u32,
    /// `session.json`, when persisting succeeded.
    pub record_path: Option<PathBuf>,
}

pub struct Orchestrator<P, X, K> {
    planner: P,
    explorer: X,
    classifier: K,
    store: SessionStore,
    budget: Budget,
    policy: LoopPolicy,
    /// Wall-clock end of the session; also bounds classification.
    session_deadline: Instant,
}

impl<P: PlanBuilder, X: Explorer, K: Classifier> Orchestrator<P, X, K> {
    pub fn new(
        planner: P,
        explorer: X,
        classifier: K,
        store: SessionStore,
        budget: Budget,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            planner,
            explorer,
            classifier,
            store,
            budget,
            policy,
            session_deadline: Instant::now() + budget.session_timeout(),
        }
    }

    /// Build the plan and the initial session state.
    ///
    /// Nothing is persisted when planning fails.
    pub fn prepare(
        &mut self,
        session_id: &str,
        app_id: &str,
        description: &str,
    ) -> Result<SessionState, CrawlError> {
        let plan = self.planner.build(app_id, description)?;
        info!(
            session_id,
            plan_id = %plan.id,
            flows = plan.flow_count(),
            "plan built"
        );
        Ok(SessionState::new(session_id, app_id, description, plan))
    }

    /// Drive `state` to a terminal phase, persist it and release the device.
    ///
    /// `on_iteration` sees the state after every explore or replan phase.
    #[instrument(skip_all, fields(session_id = %state.session_id, app_id = %state.app_id))]
    pub fn run<F: FnMut(&SessionState)>(
        mut self,
        mut state: SessionState,
        cancel: &CancelToken,
        mut on_iteration: F,
    ) -> SessionOutcome {
        let clock = Instant::now();
        let prior = state.elapsed;
        let session_deadline = clock + self.budget.session_timeout().saturating_sub(prior);
        self.session_deadline = session_deadline;
        let mut stalls = StallTracker::new(self.policy.stall_threshold);
        let mut transport_flows = BTreeSet::new();

        state.phase = Phase::Evaluating;
        let mut summary = PlanUpdateSummary::default();
        self.evaluate_into(&mut state, &mut summary);
        let mut decision = self.decide(&state);

        loop {
            state.elapsed = prior + clock.elapsed();
            if cancel.is_cancelled() {
                info!("session cancelled");
                fail(&mut state, CANCELLED.to_string());
                break;
            }
            match decision {
                Decision::Complete => {
                    state.phase = Phase::Completed;
                    state.reason = None;
                    break;
                }
                Decision::Exhaust(reason) => {
                    state.phase = Phase::Exhausted;
                    state.reason = Some(reason);
                    break;
                }
                Decision::Replan(section) => {
                    if let Err(reason) = self.replan(&mut state, &section) {
                        fail(&mut state, reason);
                        break;
                    }
                    state.elapsed = prior + clock.elapsed();
                    decision = self.decide(&state);
                    on_iteration(&state);
                }
                Decision::Explore => {
                    let deadline = self.budget.step_deadline(Instant::now(), session_deadline);
                    let explored = self.explore(
                        &mut state,
                        deadline,
                        &mut stalls,
                        &mut transport_flows,
                    );
                    state.elapsed = prior + clock.elapsed();
                    match explored {
                        Ok(meta) => {
                            decision = self.decide(&state);
                            let meta = IterationMeta {
                                decision: decision_label(&decision),
                                ..meta
                            };
                            if let Err(err) =
                                self.store
                                    .write_iteration(&state.app_id, &meta, &state.report, &state.plan)
                            {
                                fail(&mut state, CrawlError::Storage(err).to_string());
                                break;
                            }
                            on_iteration(&state);
                        }
                        Err(reason) => {
                            fail(&mut state, reason);
                            break;
                        }
                    }
                }
            }
        }

        state.elapsed = prior + clock.elapsed();
        self.finish(state)
    }

    fn decide(&self, state: &SessionState) -> Decision {
        decide(
            &state.plan,
            &state.report,
            state.iterations,
            state.elapsed,
            &self.budget,
            &state.replanned,
        )
    }

    /// One explorer step plus the evaluation that follows it.
    fn explore(
        &mut self,
        state: &mut SessionState,
        deadline: Instant,
        stalls: &mut StallTracker,
        transport_flows: &mut BTreeSet<String>,
    ) -> Result<IterationMeta, String> {
        state.phase = Phase::Exploring;
        state.iterations += 1;
        let started_at = Utc::now();
        let step_clock = Instant::now();

        let result = self.explorer.step(&state.view(), deadline);
        let ExplorationResult {
            flow_id,
            captures,
            outcome,
            failure,
            actions,
            device_calls,
        } = result;

        let mut summary = PlanUpdateSummary::default();
        let mut stored = Vec::new();
        for capture in captures {
            let seq = state.evidence.len() + 1;
            let evidence = self
                .store
                .store_capture(&state.app_id, &state.session_id, seq, capture)
                .map_err(|err| CrawlError::Storage(err).to_string())?;
            stored.push(state.evidence.len());
            state.evidence.push(evidence);
        }

        if let Some(id) = flow_id.as_deref() {
            mark_in_progress(&mut state.plan, id, &mut summary)?;
            if let Some(failure) = &failure {
                warn!(flow = id, kind = ?failure.kind, message = %failure.message, "step failed");
            }
        }
        // Only back-to-back transport failures count; any step the device
        // answered resets the streak.
        match (&failure, flow_id.as_deref()) {
            (Some(failure), Some(id)) if failure.kind == FailureKind::Transport => {
                transport_flows.insert(id.to_string());
            }
            (Some(failure), None) if failure.kind == FailureKind::Transport => {}
            _ => transport_flows.clear(),
        }
        if transport_flows.len() >= self.policy.transport_failure_limit as usize {
            let flows: Vec<&str> = transport_flows.iter().map(String::as_str).collect();
            return Err(format!(
                "device transport failed on {} flows: {}",
                flows.len(),
                flows.join(", ")
            ));
        }
        if stalls.record(flow_id.as_deref(), outcome)
            && let Some(id) = flow_id.as_deref()
        {
            info!(flow = id, threshold = self.policy.stall_threshold, "flow blocked after stalls");
            mark_blocked(&mut state.plan, id, &mut summary)?;
        }

        state.phase = Phase::Evaluating;
        self.evaluate_into(state, &mut summary);
        summary.sort();

        let ended_at = Utc::now();
        Ok(IterationMeta {
            session_id: state.session_id.clone(),
            iteration: state.iterations,
            flow_id,
            outcome,
            failure,
            actions,
            device_calls,
            captures: stored,
            plan_update: summary,
            decision: String::new(),
            started_at: started_at.to_rfc3339(),
            ended_at: ended_at.to_rfc3339(),
            duration_ms: u64::try_from(step_clock.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Evaluate and accept the report unless it regresses a completed flow.
    fn evaluate_into(&self, state: &mut SessionState, summary: &mut PlanUpdateSummary) {
        let next = evaluate(
            &state.plan,
            &state.evidence,
            &state.report,
            &self.classifier,
            EvalLimits {
                min_confidence: self.policy.min_confidence,
                deadline: self.session_deadline,
            },
        );
        let regressions = find_regressions(&state.report, &next);
        if !regressions.is_empty() {
            state.rejected_evaluations += 1;
            let err = CrawlError::EvaluationInconsistency(regressions);
            error!(err = %err, rejected = state.rejected_evaluations, "evaluation rejected");
            return;
        }
        apply_report(&mut state.plan, &next, summary);
        let unsupported = validate_completed_flows(&state.plan, &state.evidence, &next.matched_evidence);
        if !unsupported.is_empty() {
            error!(errors = %unsupported.join("; "), "completed flows lack evidence");
        }
        debug!(
            ratio = next.completion_ratio,
            completed = next.completed.len(),
            achievable = next.plan_is_achievable,
            "evaluation accepted"
        );
        state.report = next;
    }

    #[instrument(skip_all, fields(section = %section))]
    fn replan(&mut self, state: &mut SessionState, section: &str) -> Result<(), String> {
        state.phase = Phase::Replanning;
        let revised = self
            .planner
            .revise(&RevisionRequest {
                app_id: &state.app_id,
                description: &state.description,
                plan: &state.plan,
                section,
                report: &state.report,
            })
            .map_err(|err| format!("replanning section '{section}' failed: {err}"))?;
        state.replanned.insert(section.to_string());

        let before = state.plan.clone();
        let mut summary = PlanUpdateSummary::default();
        merge_section(&mut state.plan, section, revised, &mut summary)?;
        if self.policy.waive_blocked_after_replan {
            waive_blocked(&mut state.plan, section, &mut summary);
        }
        let mut problems = check_plan_amendment(&before, &state.plan);
        problems.extend(validate_plan(&state.plan));
        if !problems.is_empty() {
            error!(errors = %problems.join("; "), "revised plan rejected");
            state.plan = before;
        } else {
            info!(
                added = summary.added.len(),
                waived = summary.waived.len(),
                "section replanned"
            );
        }

        state.phase = Phase::Evaluating;
        self.evaluate_into(state, &mut summary);
        Ok(())
    }

    fn finish(mut self, mut state: SessionState) -> SessionOutcome {
        let record_path = match self.store.save_session(&state.to_record()) {
            Ok(path) => Some(path),
            Err(err) => {
                let err = CrawlError::Storage(err);
                error!(err = %err, "failed to persist session");
                if state.phase != Phase::Failed {
                    fail(&mut state, err.to_string());
                }
                None
            }
        };
        if let Err(err) = self.explorer.finish() {
            warn!(err = %err, "device release failed");
        }
        info!(
            status = ?state.status(),
            reason = state.reason.as_deref().unwrap_or(""),
            iterations = state.iterations,
            ratio = state.report.completion_ratio,
            "session finished"
        );
        SessionOutcome {
            session_id: state.session_id,
            status: state.phase.status(),
            reason: state.reason,
            report: state.report,
            plan: state.plan,
            iterations: state.iterations,
            record_path,
        }
    }
}

fn fail(state: &mut SessionState, reason: String) {
    warn!(reason = %reason, "session failed");
    state.phase = Phase::Failed;
    state.reason = Some(reason);
}

fn decision_label(decision: &Decision) -> String {
    match decision {
        Decision::Complete => "complete".to_string(),
        Decision::Exhaust(reason) => format!("exhaust: {reason}"),
        Decision::Replan(section) => format!("replan: {section}"),
        Decision::Explore => "explore".to_string(),
    }
}
