//! Planner agent: model-backed [`PlanBuilder`].

use std::time::Instant;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::core::plan::{CoveragePlan, Section};
use crate::error::{CrawlError, CrawlResult};
use crate::io::executor::Executor;
use crate::io::prompt::{PlannerPrompt, PromptBuilder, RevisionPrompt};
use crate::planner::{
    DraftFlow, DraftSection, PlanBuilder, RevisionRequest, assemble_plan, assemble_section,
};

use super::{AgentCall, AgentSettings, run_agent};

const PLANNER_OUTPUT_SCHEMA: &str = include_str!("../../schemas/planner_output.schema.json");

#[derive(Debug, Deserialize)]
struct PlannerOutput {
    sections: Vec<SectionOutput>,
    success_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SectionOutput {
    name: String,
    description: String,
    flows: Vec<FlowOutput>,
}

#[derive(Debug, Deserialize)]
struct FlowOutput {
    key: String,
    description: String,
    expect: Vec<String>,
    after: Vec<String>,
}

impl From<SectionOutput> for DraftSection {
    fn from(section: SectionOutput) -> Self {
        DraftSection {
            name: section.name.trim().to_string(),
            description: section.description.trim().to_string(),
            flows: section
                .flows
                .into_iter()
                .map(|flow| DraftFlow {
                    key: Some(flow.key),
                    description: flow.description,
                    expect: flow.expect,
                    after: flow.after,
                })
                .collect(),
        }
    }
}

/// Plan builder that asks an agent to decompose the description.
///
/// Every failure, agent or validation, surfaces as
/// [`CrawlError::PlanGeneration`].
pub struct AgentPlanBuilder<E> {
    executor: E,
    settings: AgentSettings,
    calls: u32,
}

impl<E: Executor> AgentPlanBuilder<E> {
    pub fn new(executor: E, settings: AgentSettings) -> Self {
        Self {
            executor,
            settings,
            calls: 0,
        }
    }

    fn ask(&mut self, prompt: &PlannerPrompt<'_>) -> anyhow::Result<PlannerOutput> {
        let text = PromptBuilder::new(self.settings.prompt_budget_bytes)?.planner(prompt)?;
        self.calls += 1;
        run_agent(
            &self.executor,
            &self.settings,
            AgentCall {
                agent: "planner",
                schema: PLANNER_OUTPUT_SCHEMA,
                seq: self.calls,
                prompt: text,
                deadline: Instant::now() + self.settings.call_timeout,
            },
        )
    }
}

impl<E: Executor> PlanBuilder for AgentPlanBuilder<E> {
    #[instrument(skip_all, fields(app_id = %app_id))]
    fn build(&mut self, app_id: &str, description: &str) -> CrawlResult<CoveragePlan> {
        if description.trim().is_empty() {
            return Err(CrawlError::PlanGeneration(
                "app description is empty".to_string(),
            ));
        }
        let output = self
            .ask(&PlannerPrompt {
                app_id,
                description,
                revision: None,
            })
            .map_err(|err| CrawlError::PlanGeneration(format!("{err:#}")))?;
        let plan = assemble_plan(
            app_id,
            output.sections.into_iter().map(DraftSection::from).collect(),
            output.success_criteria,
        )?;
        info!(flows = plan.flow_count(), "planner agent built plan");
        Ok(plan)
    }

    #[instrument(skip_all, fields(section = %request.section))]
    fn revise(&mut self, request: &RevisionRequest<'_>) -> CrawlResult<Section> {
        let current = request.plan.section(request.section).ok_or_else(|| {
            CrawlError::PlanGeneration(format!("unknown section '{}'", request.section))
        })?;
        let plan_json = serde_json::to_string_pretty(request.plan)
            .context("serialize plan for revision")
            .map_err(|err| CrawlError::PlanGeneration(format!("{err:#}")))?;
        let revision = RevisionPrompt {
            section: request.section.to_string(),
            blocked: current
                .flows
                .iter()
                .filter(|flow| request.report.blocked.contains(&flow.id))
                .map(|flow| flow.id.clone())
                .collect(),
            plan: plan_json,
            feedback: request.report.feedback.clone(),
        };
        let output = self
            .ask(&PlannerPrompt {
                app_id: request.app_id,
                description: request.description,
                revision: Some(revision),
            })
            .map_err(|err| CrawlError::PlanGeneration(format!("{err:#}")))?;

        let mut sections = output.sections.into_iter();
        let revised = match sections.next() {
            Some(section) if section.name.trim() == request.section => section,
            Some(section) => {
                warn!(returned = %section.name, "planner revised a different section");
                return Err(CrawlError::PlanGeneration(format!(
                    "revision returned section '{}' instead of '{}'",
                    section.name, request.section
                )));
            }
            None => {
                return Err(CrawlError::PlanGeneration(
                    "revision returned no sections".to_string(),
                ));
            }
        };
        Ok(assemble_section(request.plan, revised.into()))
    }
}
