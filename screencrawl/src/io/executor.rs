//! Agent execution backends.
//!
//! Model-backed collaborators (planner, navigator, classifier) hand an
//! [`ExecRequest`] to an [`Executor`] and read back a JSON document that must
//! satisfy the request's output schema. Tests substitute executors that write
//! canned output without spawning anything.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::io::process::run_command_with_timeout;

/// Parameters for an executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub workdir: PathBuf,
    pub prompt: String,
    /// JSON Schema the agent output must satisfy.
    pub output_schema_path: PathBuf,
    /// Where the agent writes its final JSON message.
    pub output_path: PathBuf,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

pub trait Executor {
    /// Run the agent. On success `request.output_path` holds its output.
    fn exec(&self, request: &ExecRequest) -> Result<()>;
}

impl<E: Executor + ?Sized> Executor for &E {
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        (**self).exec(request)
    }
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        (**self).exec(request)
    }
}

/// Spawns a configurable agent CLI.
///
/// The configured command (default `codex exec --skip-git-repo-check`) gets
/// `--output-schema <schema> --output-last-message <output> -` appended and
/// reads the prompt from stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Executor for CommandExecutor {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn exec(&self, request: &ExecRequest) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("agent command is empty"))?;
        if !request.output_schema_path.exists() {
            bail!(
                "missing output schema {}",
                request.output_schema_path.display()
            );
        }
        if let Some(parent) = request.output_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create output dir {}", parent.display()))?;
        }
        info!(program = %program, workdir = %request.workdir.display(), "starting agent");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--output-schema")
            .arg(&request.output_schema_path)
            .arg("--output-last-message")
            .arg(&request.output_path)
            .arg("-")
            .current_dir(&request.workdir);

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run agent {program}"))?;
        write_log(&request.log_path, &output.transcript())?;

        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            bail!("agent timed out after {:?}", request.timeout);
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "agent failed");
            bail!("agent failed with status {:?}", output.status.code());
        }
        debug!("agent completed");
        Ok(())
    }
}

/// Run the agent, then parse and schema-check its output as `T`.
#[instrument(skip_all, fields(output_path = %request.output_path.display()))]
pub fn execute_and_load_json<E: Executor + ?Sized, T: DeserializeOwned>(
    executor: &E,
    request: &ExecRequest,
) -> Result<T> {
    executor.exec(request)?;
    if !request.output_path.exists() {
        bail!("missing agent output {}", request.output_path.display());
    }
    let instance = read_json(&request.output_path)?;
    let schema = read_json(&request.output_schema_path)?;
    validate_schema(&instance, &schema)
        .with_context(|| format!("validate {}", request.output_path.display()))?;
    serde_json::from_value(instance)
        .with_context(|| format!("decode {}", request.output_path.display()))
}

/// Validate a JSON instance against a Draft 2020-12 schema.
pub fn validate_schema(instance: &Value, schema: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}

fn read_json(path: &Path) -> Result<Value> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_log(path: &Path, transcript: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    fs::write(path, transcript).with_context(|| format!("write agent log {}", path.display()))
}
