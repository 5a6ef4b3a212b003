//! Prompt rendering for model-backed collaborators.
//!
//! Templates live in `prompts/*.md` and mark their sections with
//! `<!-- section:KEY required|droppable -->`. When a rendered prompt exceeds
//! the byte budget, droppable sections go first (page source, then plan,
//! then labels, then feedback) and the last remaining section is truncated.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::plan::Flow;

const PLANNER_TEMPLATE: &str = include_str!("prompts/planner.md");
const NAVIGATOR_TEMPLATE: &str = include_str!("prompts/navigator.md");
const CLASSIFIER_TEMPLATE: &str = include_str!("prompts/classifier.md");

const DROP_ORDER: [&str; 4] = ["page_source", "plan", "labels", "feedback"];
const TRUNCATION_MARK: &str = "\n[truncated]";

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("valid section regex")
});

/// Revision context for a planner prompt.
#[derive(Debug, Clone, Serialize)]
pub struct RevisionPrompt {
    pub section: String,
    pub blocked: Vec<String>,
    /// Current plan, pretty-printed.
    pub plan: String,
    pub feedback: String,
}

#[derive(Debug, Clone)]
pub struct PlannerPrompt<'a> {
    pub app_id: &'a str,
    pub description: &'a str,
    pub revision: Option<RevisionPrompt>,
}

#[derive(Debug, Clone)]
pub struct NavigatorPrompt<'a> {
    pub app_id: &'a str,
    pub flow: &'a Flow,
    pub labels: &'a [String],
    pub fingerprint: &'a str,
    pub attempt: u32,
    pub feedback: Option<&'a str>,
    pub page_source: &'a str,
    pub max_actions: usize,
}

#[derive(Debug, Clone)]
pub struct ClassifierPrompt<'a> {
    pub flow: &'a Flow,
    pub labels: &'a [String],
    pub screenshot: &'a str,
    pub page_source: Option<&'a str>,
}

/// Renders prompts and fits them into a byte budget.
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("planner", PLANNER_TEMPLATE)
            .context("load planner template")?;
        env.add_template("navigator", NAVIGATOR_TEMPLATE)
            .context("load navigator template")?;
        env.add_template("classifier", CLASSIFIER_TEMPLATE)
            .context("load classifier template")?;
        Ok(Self { env, budget_bytes })
    }

    pub fn planner(&self, input: &PlannerPrompt<'_>) -> Result<String> {
        self.render(
            "planner",
            context! {
                app_id => input.app_id,
                description => input.description.trim(),
                revision => input.revision,
            },
        )
    }

    pub fn navigator(&self, input: &NavigatorPrompt<'_>) -> Result<String> {
        self.render(
            "navigator",
            context! {
                app_id => input.app_id,
                flow => input.flow,
                labels => input.labels,
                fingerprint => input.fingerprint,
                attempt => input.attempt,
                feedback => input.feedback.map(str::trim).filter(|s| !s.is_empty()),
                page_source => input.page_source.trim(),
                max_actions => input.max_actions,
            },
        )
    }

    pub fn classifier(&self, input: &ClassifierPrompt<'_>) -> Result<String> {
        self.render(
            "classifier",
            context! {
                flow => input.flow,
                labels => input.labels,
                screenshot => input.screenshot,
                page_source => input.page_source.map(str::trim).filter(|s| !s.is_empty()),
            },
        )
    }

    fn render(&self, name: &str, ctx: minijinja::Value) -> Result<String> {
        let rendered = self
            .env
            .get_template(name)
            .and_then(|template| template.render(ctx))
            .with_context(|| format!("render {name} prompt"))?;
        let mut sections = parse_sections(&rendered);
        fit_to_budget(&mut sections, self.budget_bytes);
        Ok(sections
            .iter()
            .map(|section| section.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"))
    }
}

#[derive(Debug, Clone)]
struct Section {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<Section> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::with_capacity(markers.len());
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        let required = kind.as_str() == "required";
        if !content.is_empty() || required {
            sections.push(Section {
                key: key.as_str().to_string(),
                required,
                content,
            });
        }
    }
    sections
}

fn fit_to_budget(sections: &mut Vec<Section>, budget: usize) {
    let total = |secs: &[Section]| secs.iter().map(|s| s.content.len()).sum::<usize>();
    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section"
            );
            sections.remove(idx);
        }
    }

    let over = total(sections).saturating_sub(budget);
    if over == 0 {
        return;
    }
    let Some(last) = sections.last_mut() else {
        return;
    };
    let keep = last
        .content
        .len()
        .saturating_sub(over + TRUNCATION_MARK.len());
    let cut = floor_char_boundary(&last.content, keep);
    last.content.truncate(cut);
    last.content.push_str(TRUNCATION_MARK);
    debug!(section = %last.key, kept = cut, "truncated prompt section");
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
