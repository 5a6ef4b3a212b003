//! Crawler configuration stored under `.screencrawl/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::budget::Budget;
use crate::error::CrawlError;
use crate::io::write_atomic;
use crate::manager::LoopPolicy;

/// Crawler configuration (TOML).
///
/// Edited by humans; missing fields default to the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CrawlConfig {
    /// Explorer steps allowed per session.
    pub max_iterations: u32,

    /// Wall-clock budget for a whole session in seconds.
    pub session_timeout_secs: u64,

    /// Wall-clock budget for one explorer step in seconds.
    pub step_timeout_secs: u64,

    /// Primitive device calls allowed per explorer step.
    pub turn_budget: u32,

    /// Consecutive non-advancing steps on one flow before it is blocked.
    pub stall_threshold: u32,

    /// Distinct flows with transport failures before the session fails.
    pub transport_failure_limit: u32,

    /// Minimum classifier confidence for a flow to count as completed.
    pub min_confidence: f64,

    /// Count blocked flows toward coverage once their section was replanned.
    pub waive_blocked_after_replan: bool,

    /// Root for session records, screenshots and page sources.
    pub artifacts_dir: PathBuf,

    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; schema, output and prompt arguments are appended.
    pub command: Vec<String>,

    /// Truncate agent stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Prompt size budget; optional sections are dropped beyond it.
    pub prompt_budget_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
            ],
            output_limit_bytes: 100_000,
            prompt_budget_bytes: 24_000,
        }
    }
}

impl Default for CrawlConfig {
    fn default() -> Self {
        let budget = Budget::default();
        let policy = LoopPolicy::default();
        Self {
            max_iterations: budget.max_iterations,
            session_timeout_secs: budget.session_timeout_secs,
            step_timeout_secs: budget.step_timeout_secs,
            turn_budget: policy.turn_budget,
            stall_threshold: policy.stall_threshold,
            transport_failure_limit: policy.transport_failure_limit,
            min_confidence: policy.min_confidence,
            waive_blocked_after_replan: policy.waive_blocked_after_replan,
            artifacts_dir: PathBuf::from("test_artifacts"),
            agent: AgentConfig::default(),
        }
    }
}

impl CrawlConfig {
    pub fn validate(&self) -> Result<(), CrawlError> {
        let invalid = |message: &str| Err(CrawlError::Config(message.to_string()));
        if self.max_iterations == 0 {
            return invalid("max_iterations must be > 0");
        }
        if self.session_timeout_secs == 0 || self.step_timeout_secs == 0 {
            return invalid("session_timeout_secs and step_timeout_secs must be > 0");
        }
        if self.turn_budget == 0 {
            return invalid("turn_budget must be > 0");
        }
        if self.stall_threshold == 0 {
            return invalid("stall_threshold must be > 0");
        }
        if self.transport_failure_limit == 0 {
            return invalid("transport_failure_limit must be > 0");
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return invalid("min_confidence must be within [0, 1]");
        }
        if self.artifacts_dir.as_os_str().is_empty() {
            return invalid("artifacts_dir must not be empty");
        }
        if self.agent.command.first().is_none_or(|program| program.trim().is_empty()) {
            return invalid("agent.command must be a non-empty array");
        }
        if self.agent.output_limit_bytes == 0 || self.agent.prompt_budget_bytes == 0 {
            return invalid("agent byte limits must be > 0");
        }
        Ok(())
    }

    pub fn budget(&self) -> Budget {
        Budget {
            max_iterations: self.max_iterations,
            session_timeout_secs: self.session_timeout_secs,
            step_timeout_secs: self.step_timeout_secs,
        }
    }

    pub fn policy(&self) -> LoopPolicy {
        LoopPolicy {
            turn_budget: self.turn_budget,
            stall_threshold: self.stall_threshold,
            transport_failure_limit: self.transport_failure_limit,
            min_confidence: self.min_confidence,
            waive_blocked_after_replan: self.waive_blocked_after_replan,
        }
    }

    /// Resolve `artifacts_dir` against `root` when it is relative.
    pub fn artifacts_root(&self, root: &Path) -> PathBuf {
        if self.artifacts_dir.is_absolute() {
            self.artifacts_dir.clone()
        } else {
            root.join(&self.artifacts_dir)
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `CrawlConfig::default()`.
pub fn load_config(path: &Path) -> Result<CrawlConfig> {
    if !path.exists() {
        return Ok(CrawlConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: CrawlConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &CrawlConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, CrawlConfig::default());
        assert_eq!(cfg.max_iterations, 20);
        assert_eq!(cfg.stall_threshold, 3);
        assert!(!cfg.waive_blocked_after_replan);
    }

    #[test]
    fn write_then_load_keeps_edits() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(".screencrawl/config.toml");
        let cfg = CrawlConfig {
            max_iterations: 5,
            min_confidence: 0.75,
            ..CrawlConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.budget().max_iterations, 5);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "stall_threshold = 5\n[agent]\ncommand = [\"my-agent\"]\n")
            .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.stall_threshold, 5);
        assert_eq!(cfg.agent.command, vec!["my-agent".to_string()]);
        assert_eq!(cfg.agent.output_limit_bytes, 100_000);
        assert_eq!(cfg.turn_budget, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "min_confidence = 1.5\n").expect("write");
        let err = load_config(&path).expect_err("invalid confidence");
        assert!(format!("{err:#}").contains("min_confidence"));

        let cfg = CrawlConfig {
            agent: AgentConfig {
                command: Vec::new(),
                ..AgentConfig::default()
            },
            ..CrawlConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CrawlError::Config(_))));
    }

    #[test]
    fn relative_artifacts_dir_resolves_against_root() {
        let cfg = CrawlConfig::default();
        assert_eq!(
            cfg.artifacts_root(Path::new("/work")),
            PathBuf::from("/work/test_artifacts")
        );
    }
}
