//! Shared deterministic types for the exploration core.
//!
//! These types define stable contracts between the planner, explorer,
//! evaluator and orchestrator. They carry no I/O handles and serialize to the
//! session record verbatim, so field order and naming are part of the
//! persisted format.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fingerprint::Fingerprint;

/// Lifecycle of a single flow inside a coverage plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Blocked,
}

impl FlowStatus {
    /// True for flows the explorer may still work on.
    pub fn is_open(self) -> bool {
        matches!(self, FlowStatus::Pending | FlowStatus::InProgress)
    }
}

/// One captured screen: screenshot plus structural snapshot summary.
///
/// Evidence is append-only. Once pushed into the session it is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    pub captured_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    /// Opaque screenshot reference returned by the device (path or URI).
    pub screenshot: String,
    /// Persisted page-source snapshot, filled in by the session store.
    pub page_source: Option<String>,
    /// Visible element labels extracted from the page source.
    pub labels: Vec<String>,
    /// Flow the explorer was working on when the screen was captured.
    pub flow_id: Option<String>,
}

/// Outcome tag for one explorer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Advanced,
    NoProgress,
    ActionFailed,
}

impl StepOutcome {
    /// True for outcomes that count toward the stall threshold.
    pub fn is_stalled(self) -> bool {
        !matches!(self, StepOutcome::Advanced)
    }
}

/// Why an explorer step ended with `action_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The device could not be reached.
    Transport,
    /// The requested element or target does not exist.
    Target,
    /// The step deadline expired before the turn finished.
    Timeout,
}

/// Progress report produced by the coverage evaluator.
///
/// Sets are ordered so that two evaluations over the same inputs serialize to
/// identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CoverageReport {
    pub completion_ratio: f64,
    pub completed: BTreeSet<String>,
    pub remaining: BTreeSet<String>,
    pub blocked: BTreeSet<String>,
    /// Blocked flows plus pending flows that transitively depend on one.
    pub unreachable: BTreeSet<String>,
    /// Index into the evidence list of the first record matching each completed flow.
    pub matched_evidence: BTreeMap<String, usize>,
    pub feedback: String,
    pub plan_is_achievable: bool,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.completion_ratio >= 1.0
    }
}

/// Terminal and non-terminal session status as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Exhausted,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Running)
    }
}

/// Orchestrator phase (the state machine's states).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Initializing,
    Exploring,
    Evaluating,
    Replanning,
    Completed,
    Exhausted,
    Failed,
}

impl Phase {
    /// Map a phase to the caller-facing status.
    pub fn status(self) -> SessionStatus {
        match self {
            Phase::Completed => SessionStatus::Completed,
            Phase::Exhausted => SessionStatus::Exhausted,
            Phase::Failed => SessionStatus::Failed,
            Phase::Initializing | Phase::Exploring | Phase::Evaluating | Phase::Replanning => {
                SessionStatus::Running
            }
        }
    }
}

/// Plan status changes applied by the orchestrator during one iteration.
///
/// Lists are sorted so that iteration logs are stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PlanUpdateSummary {
    pub started: Vec<String>,
    pub completed_set: Vec<String>,
    pub blocked_set: Vec<String>,
    pub added: Vec<String>,
    pub waived: Vec<String>,
}

impl PlanUpdateSummary {
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
            && self.completed_set.is_empty()
            && self.blocked_set.is_empty()
            && self.added.is_empty()
            && self.waived.is_empty()
    }

    pub fn sort(&mut self) {
        self.started.sort();
        self.completed_set.sort();
        self.blocked_set.sort();
        self.added.sort();
        self.waived.sort();
    }
}
