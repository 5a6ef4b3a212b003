//! Session artifacts on disk.
//!
//! ```text
//! <artifacts>/<app_slug>/<session_id>/
//!   session.json          final record (plan, evidence, report, status)
//!   screenshots/NNNN.*    copies of file-backed screenshots
//!   pagesource/NNNN.xml   page source behind each evidence record
//!   iterations/<n>/       action trace, see `iteration_log`
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::core::plan::{CoveragePlan, unique_slug};
use crate::core::types::{CoverageReport, Evidence, Phase, SessionStatus};
use crate::explore::Capture;
use crate::io::iteration_log::{IterationMeta, write_iteration};
use crate::io::write_json;

const SESSION_FILE: &str = "session.json";

/// Terminal snapshot of a session, as read by the gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub app_id: String,
    pub description: String,
    pub status: SessionStatus,
    pub phase: Phase,
    pub reason: Option<String>,
    pub iterations: u32,
    pub elapsed_ms: u64,
    pub rejected_evaluations: u32,
    pub replanned_sections: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub plan: CoveragePlan,
    pub evidence: Vec<Evidence>,
    pub report: CoverageReport,
}

pub fn app_slug(app_id: &str) -> String {
    unique_slug(app_id, &mut HashSet::new())
}

/// Writes session artifacts under one artifacts root.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, app_id: &str, session_id: &str) -> PathBuf {
        self.root.join(app_slug(app_id)).join(session_id)
    }

    /// Persist a capture's page source (and screenshot, when it is a file)
    /// and return its evidence pointing at the stored copies.
    ///
    /// `seq` is the 1-based evidence number within the session.
    pub fn store_capture(
        &self,
        app_id: &str,
        session_id: &str,
        seq: usize,
        capture: Capture,
    ) -> Result<Evidence> {
        let dir = self.session_dir(app_id, session_id);
        let source_dir = dir.join("pagesource");
        let shot_dir = dir.join("screenshots");
        for sub in [&source_dir, &shot_dir] {
            fs::create_dir_all(sub).with_context(|| format!("create {}", sub.display()))?;
        }

        let mut evidence = capture.evidence;
        let source_path = source_dir.join(format!("{seq:04}.xml"));
        fs::write(&source_path, &capture.page_source)
            .with_context(|| format!("write {}", source_path.display()))?;
        evidence.page_source = Some(source_path.display().to_string());

        let original = Path::new(&evidence.screenshot);
        if original.is_file() {
            let ext = original
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("png");
            let copy = shot_dir.join(format!("{seq:04}.{ext}"));
            fs::copy(original, &copy).with_context(|| {
                format!("copy screenshot {} to {}", original.display(), copy.display())
            })?;
            evidence.screenshot = copy.display().to_string();
        }
        debug!(seq, fingerprint = %evidence.fingerprint.short(), "stored capture");
        Ok(evidence)
    }

    pub fn write_iteration(
        &self,
        app_id: &str,
        meta: &IterationMeta,
        report: &CoverageReport,
        plan: &CoveragePlan,
    ) -> Result<()> {
        write_iteration(&self.session_dir(app_id, &meta.session_id), meta, report, plan)?;
        Ok(())
    }

    #[instrument(skip_all, fields(session_id = %record.session_id))]
    pub fn save_session(&self, record: &SessionRecord) -> Result<PathBuf> {
        let dir = self.session_dir(&record.app_id, &record.session_id);
        fs::create_dir_all(dir.join("screenshots"))
            .with_context(|| format!("create session dir {}", dir.display()))?;
        let path = dir.join(SESSION_FILE);
        write_json(&path, record)?;
        info!(path = %path.display(), status = ?record.status, "session persisted");
        Ok(path)
    }

    /// Find a persisted session by id across all apps.
    pub fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        if !self.root.is_dir() {
            return Ok(None);
        }
        let entries =
            fs::read_dir(&self.root).with_context(|| format!("read {}", self.root.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read {}", self.root.display()))?;
            let path = entry.path().join(session_id).join(SESSION_FILE);
            if !path.is_file() {
                continue;
            }
            let contents =
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
            let record = serde_json::from_str(&contents)
                .with_context(|| format!("parse {}", path.display()))?;
            return Ok(Some(record));
        }
        Ok(None)
    }
}
