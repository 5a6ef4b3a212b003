//! Per-iteration action trace under `<session>/iterations/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::plan::CoveragePlan;
use crate::core::types::{CoverageReport, PlanUpdateSummary, StepOutcome};
use crate::explore::StepFailure;
use crate::io::device::DeviceAction;
use crate::io::write_json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationMeta {
    pub session_id: String,
    pub iteration: u32,
    pub flow_id: Option<String>,
    pub outcome: StepOutcome,
    pub failure: Option<StepFailure>,
    pub actions: Vec<DeviceAction>,
    pub device_calls: u32,
    /// Evidence indexes captured during this iteration.
    pub captures: Vec<usize>,
    pub plan_update: PlanUpdateSummary,
    /// Decision taken after evaluating this iteration, e.g. `explore`.
    pub decision: String,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub report_path: PathBuf,
    pub plan_path: PathBuf,
}

impl IterationPaths {
    pub fn new(session_dir: &Path, iteration: u32) -> Self {
        let dir = session_dir.join("iterations").join(iteration.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            report_path: dir.join("report.json"),
            plan_path: dir.join("plan.json"),
            dir,
        }
    }
}

pub fn write_iteration(
    session_dir: &Path,
    meta: &IterationMeta,
    report: &CoverageReport,
    plan: &CoveragePlan,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(session_dir, meta.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;
    write_json(&paths.meta_path, meta)?;
    write_json(&paths.report_path, report)?;
    write_json(&paths.plan_path, plan)?;
    Ok(paths)
}
