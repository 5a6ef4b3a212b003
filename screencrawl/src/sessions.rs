//! Session registry: `start_session / get_status / cancel / wait`.
//!
//! Each session runs its orchestrator on a dedicated thread. Live status is
//! published into the registry after every iteration; once a session is
//! persisted it leaves the live table and is answered from the store. The
//! thread drops its own join handle on exit, leaving the outcome in a small
//! ring of recently finished sessions for `wait`.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::budget::Budget;
use crate::core::classifier::Classifier;
use crate::core::types::{Phase, SessionStatus};
use crate::error::{CrawlError, CrawlResult};
use crate::explore::Explorer;
use crate::io::session_store::{SessionRecord, SessionStore};
use crate::manager::{CancelToken, LoopPolicy, Orchestrator, SessionOutcome, SessionState};
use crate::planner::PlanBuilder;

/// The three collaborators one session drives.
pub struct Collaborators {
    pub planner: Box<dyn PlanBuilder + Send>,
    pub explorer: Box<dyn Explorer + Send>,
    pub classifier: Box<dyn Classifier + Send>,
}

/// Creates fresh collaborators (and so a fresh device) per session.
pub trait CollaboratorFactory {
    fn create(&self, app_id: &str) -> CrawlResult<Collaborators>;
}

impl<F> CollaboratorFactory for F
where
    F: Fn(&str) -> CrawlResult<Collaborators>,
{
    fn create(&self, app_id: &str) -> CrawlResult<Collaborators> {
        self(app_id)
    }
}

/// Point-in-time view of a session, live or persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub session_id: String,
    pub app_id: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub reason: Option<String>,
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub completion_ratio: f64,
    pub completed: Vec<String>,
    pub remaining: Vec<String>,
    pub blocked: Vec<String>,
}

impl StatusSummary {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            app_id: state.app_id.clone(),
            status: state.status(),
            phase: state.phase,
            reason: state.reason.clone(),
            iterations: state.iterations,
            elapsed_ms: u64::try_from(state.elapsed.as_millis()).unwrap_or(u64::MAX),
            completion_ratio: state.report.completion_ratio,
            completed: state.report.completed.iter().cloned().collect(),
            remaining: state.report.remaining.iter().cloned().collect(),
            blocked: state.report.blocked.iter().cloned().collect(),
        }
    }

    pub fn from_record(record: &SessionRecord) -> Self {
        Self {
            session_id: record.session_id.clone(),
            app_id: record.app_id.clone(),
            status: record.status,
            phase: record.phase,
            reason: record.reason.clone(),
            iterations: record.iterations,
            elapsed_ms: record.elapsed_ms,
            completion_ratio: record.report.completion_ratio,
            completed: record.report.completed.iter().cloned().collect(),
            remaining: record.report.remaining.iter().cloned().collect(),
            blocked: record.report.blocked.iter().cloned().collect(),
        }
    }
}

struct LiveSession {
    cancel: CancelToken,
    status: StatusSummary,
}

type LiveTable = Arc<Mutex<HashMap<String, LiveSession>>>;
type HandleTable = Arc<Mutex<HashMap<String, JoinHandle<SessionOutcome>>>>;
type FinishedRing = Arc<Mutex<VecDeque<SessionOutcome>>>;

/// Outcomes kept in memory after their thread exits.
const FINISHED_CAPACITY: usize = 32;

pub struct SessionRegistry<F> {
    factory: F,
    store: SessionStore,
    policy: LoopPolicy,
    live: LiveTable,
    handles: HandleTable,
    finished: FinishedRing,
}

impl<F: CollaboratorFactory> SessionRegistry<F> {
    pub fn new(factory: F, store: SessionStore, policy: LoopPolicy) -> Self {
        Self {
            factory,
            store,
            policy,
            live: Arc::default(),
            handles: Arc::default(),
            finished: Arc::default(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Build the plan, then run the session in the background.
    ///
    /// Planning happens on the caller's thread: a plan generation failure is
    /// returned here and nothing is registered or persisted.
    pub fn start_session(
        &self,
        app_id: &str,
        description: &str,
        budget: Budget,
    ) -> CrawlResult<String> {
        let session_id = Uuid::new_v4().to_string();
        let Collaborators {
            planner,
            explorer,
            classifier,
        } = self.factory.create(app_id)?;
        let mut orchestrator = Orchestrator::new(
            planner,
            explorer,
            classifier,
            self.store.clone(),
            budget,
            self.policy,
        );
        let state = orchestrator.prepare(&session_id, app_id, description)?;

        let cancel = CancelToken::new();
        lock(&self.live).insert(
            session_id.clone(),
            LiveSession {
                cancel: cancel.clone(),
                status: StatusSummary::from_state(&state),
            },
        );

        let live = Arc::clone(&self.live);
        let handles = Arc::clone(&self.handles);
        let finished = Arc::clone(&self.finished);
        // Held across the spawn so the thread cannot drop its handle before
        // it is inserted.
        let mut table = lock(&self.handles);
        let handle = thread::spawn(move || {
            let outcome = orchestrator.run(state, &cancel, |state| {
                if let Some(entry) = lock(&live).get_mut(&state.session_id) {
                    entry.status = StatusSummary::from_state(state);
                }
            });
            {
                let mut ring = lock(&finished);
                if ring.len() == FINISHED_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(outcome.clone());
            }
            lock(&live).remove(&outcome.session_id);
            lock(&handles).remove(&outcome.session_id);
            outcome
        });
        table.insert(session_id.clone(), handle);
        drop(table);
        info!(session_id = %session_id, app_id, "session started");
        Ok(session_id)
    }

    /// Live status first, then the persisted record.
    pub fn get_status(&self, session_id: &str) -> CrawlResult<StatusSummary> {
        if let Some(entry) = lock(&self.live).get(session_id) {
            return Ok(entry.status.clone());
        }
        self.store
            .load_session(session_id)?
            .map(|record| StatusSummary::from_record(&record))
            .ok_or_else(|| CrawlError::SessionNotFound(session_id.to_string()))
    }

    /// Request cancellation; the session stops at its next phase boundary.
    ///
    /// Cancelling a session that already finished is a no-op.
    pub fn cancel(&self, session_id: &str) -> CrawlResult<()> {
        if let Some(entry) = lock(&self.live).get(session_id) {
            info!(session_id, "cancellation requested");
            entry.cancel.cancel();
            return Ok(());
        }
        match self.store.load_session(session_id)? {
            Some(_) => Ok(()),
            None => Err(CrawlError::SessionNotFound(session_id.to_string())),
        }
    }

    /// Block until the session is terminal and return its outcome.
    pub fn wait(&self, session_id: &str) -> CrawlResult<SessionOutcome> {
        let handle = lock(&self.handles).remove(session_id);
        if let Some(handle) = handle {
            return handle.join().map_err(|_| {
                warn!(session_id, "session thread panicked");
                CrawlError::Storage(anyhow!("session {session_id} ended without a record"))
            });
        }
        let recent = lock(&self.finished)
            .iter()
            .rev()
            .find(|outcome| outcome.session_id == session_id)
            .cloned();
        if let Some(outcome) = recent {
            return Ok(outcome);
        }
        let record = self
            .store
            .load_session(session_id)?
            .ok_or_else(|| CrawlError::SessionNotFound(session_id.to_string()))?;
        let path = self
            .store
            .session_dir(&record.app_id, &record.session_id)
            .join("session.json");
        Ok(outcome_from_record(record, path))
    }

    /// Ids of sessions that have not reached a terminal phase, sorted.
    pub fn live_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.live).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of session threads still holding a join handle.
    pub fn running_threads(&self) -> usize {
        lock(&self.handles).len()
    }
}

fn outcome_from_record(record: SessionRecord, path: PathBuf) -> SessionOutcome {
    SessionOutcome {
        session_id: record.session_id,
        status: record.status,
        reason: record.reason,
        report: record.report,
        plan: record.plan,
        iterations: record.iterations,
        record_path: Some(path),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
