//! Classifier agent: model-backed [`Classifier`] with a verdict cache.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::core::classifier::{Classification, Classifier};
use crate::core::plan::Flow;
use crate::core::types::Evidence;
use crate::io::executor::Executor;
use crate::io::prompt::{ClassifierPrompt, PromptBuilder};

use super::{AgentCall, AgentSettings, run_agent};

const CLASSIFIER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/classifier_output.schema.json");

#[derive(Debug, Deserialize)]
struct ClassifierOutput {
    completed: bool,
    confidence: f64,
    reason: String,
}

struct Inner<E> {
    executor: E,
    calls: u32,
    verdicts: HashMap<(String, String), Classification>,
}

/// Classifier that asks an agent, once per (screen, flow) pair.
///
/// Verdicts are cached by fingerprint and flow id so repeated evaluations
/// over the same evidence agree. Agent failures and calls skipped at the
/// deadline count as no match for this evaluation only, so the pair is asked
/// again next time.
pub struct AgentClassifier<E> {
    settings: AgentSettings,
    inner: Mutex<Inner<E>>,
}

impl<E: Executor> AgentClassifier<E> {
    pub fn new(executor: E, settings: AgentSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                executor,
                calls: 0,
                verdicts: HashMap::new(),
            }),
        }
    }

    fn ask(
        &self,
        inner: &mut Inner<E>,
        evidence: &Evidence,
        flow: &Flow,
        deadline: Instant,
    ) -> anyhow::Result<Classification> {
        let page_source = evidence
            .page_source
            .as_deref()
            .and_then(|path| fs::read_to_string(path).ok());
        let prompt = PromptBuilder::new(self.settings.prompt_budget_bytes)?.classifier(
            &ClassifierPrompt {
                flow,
                labels: &evidence.labels,
                screenshot: &evidence.screenshot,
                page_source: page_source.as_deref(),
            },
        )?;
        inner.calls += 1;
        let output: ClassifierOutput = run_agent(
            &inner.executor,
            &self.settings,
            AgentCall {
                agent: "classifier",
                schema: CLASSIFIER_OUTPUT_SCHEMA,
                seq: inner.calls,
                prompt,
                deadline: (Instant::now() + self.settings.call_timeout).min(deadline),
            },
        )?;
        debug!(flow = %flow.id, completed = output.completed, reason = %output.reason, "classifier verdict");
        Ok(Classification {
            completed: output.completed,
            confidence: output.confidence.clamp(0.0, 1.0),
        })
    }
}

impl<E: Executor> Classifier for AgentClassifier<E> {
    fn classify(&self, evidence: &Evidence, flow: &Flow, deadline: Instant) -> Classification {
        let key = (evidence.fingerprint.as_str().to_string(), flow.id.clone());
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(verdict) = inner.verdicts.get(&key) {
            return *verdict;
        }
        if Instant::now() >= deadline {
            debug!(flow = %flow.id, "classifier skipped past deadline");
            return Classification::no_match();
        }
        match self.ask(&mut inner, evidence, flow, deadline) {
            Ok(verdict) => {
                inner.verdicts.insert(key, verdict);
                verdict
            }
            Err(err) => {
                warn!(flow = %flow.id, err = %format!("{err:#}"), "classifier agent failed");
                Classification::no_match()
            }
        }
    }
}
