//! Model-backed collaborators: planner, navigator and classifier agents.
//!
//! Each agent renders a prompt, writes its output schema under the state
//! directory and runs one [`Executor`] call per invocation. Per-call files
//! land in `<state_dir>/agents/<agent>/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

use crate::core::budget::remaining_budget;
use crate::io::config::CrawlConfig;
use crate::io::executor::{ExecRequest, Executor, execute_and_load_json};

pub mod classifier;
pub mod navigator;
pub mod planner;

pub(crate) fn write_output_schema(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create schema dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write schema {}", path.display()))
}

/// Settings shared by every agent.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Working directory for the agent process.
    pub workdir: PathBuf,
    /// Schemas and per-call logs go here.
    pub state_dir: PathBuf,
    pub prompt_budget_bytes: usize,
    pub output_limit_bytes: usize,
    /// Cap for calls made without a caller deadline (planning, classifying).
    pub call_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(root: &Path, state_dir: &Path, config: &CrawlConfig) -> Self {
        Self {
            workdir: root.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
            prompt_budget_bytes: config.agent.prompt_budget_bytes,
            output_limit_bytes: config.agent.output_limit_bytes,
            call_timeout: config.budget().step_timeout(),
        }
    }
}

/// One agent invocation's identity and payload.
pub(crate) struct AgentCall<'a> {
    pub agent: &'a str,
    pub schema: &'a str,
    pub seq: u32,
    pub prompt: String,
    pub deadline: Instant,
}

pub(crate) fn run_agent<E: Executor + ?Sized, T: DeserializeOwned>(
    executor: &E,
    settings: &AgentSettings,
    call: AgentCall<'_>,
) -> Result<T> {
    let schema_path = settings
        .state_dir
        .join(format!("{}_output.schema.json", call.agent));
    write_output_schema(&schema_path, call.schema)?;

    let call_dir = settings
        .state_dir
        .join("agents")
        .join(call.agent)
        .join(format!("{:04}", call.seq));
    fs::create_dir_all(&call_dir)
        .with_context(|| format!("create agent dir {}", call_dir.display()))?;
    fs::write(call_dir.join("prompt.md"), &call.prompt)
        .with_context(|| format!("write prompt {}", call_dir.display()))?;

    let request = ExecRequest {
        workdir: settings.workdir.clone(),
        prompt: call.prompt,
        output_schema_path: schema_path,
        output_path: call_dir.join("output.json"),
        log_path: call_dir.join("agent.log"),
        timeout: remaining_budget(call.deadline)?,
        output_limit_bytes: settings.output_limit_bytes,
    };
    execute_and_load_json(executor, &request)
}
