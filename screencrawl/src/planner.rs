//! Plan building: app description in, coverage plan out.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};

use crate::core::invariants::validate_plan;
use crate::core::plan::{CoveragePlan, Flow, Section, unique_slug};
use crate::core::types::CoverageReport;
use crate::error::{CrawlError, CrawlResult};

static EXPECT_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[expect:\s*([^\]]*)\]").expect("expect regex"));
static AFTER_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(after:\s*([^)]*)\)").expect("after regex"));
static LIST_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[-*]|\d+[.)])\s+").expect("list regex"));

pub const DEFAULT_SECTION: &str = "Main";

/// Inputs for revising one section of a plan.
#[derive(Debug, Clone, Copy)]
pub struct RevisionRequest<'a> {
    pub app_id: &'a str,
    pub description: &'a str,
    pub plan: &'a CoveragePlan,
    pub section: &'a str,
    pub report: &'a CoverageReport,
}

/// Turns an app description into a coverage plan, and revises sections
/// whose flows turned out to be unreachable.
pub trait PlanBuilder {
    /// Never returns an empty plan: failure to decompose the description is
    /// [`CrawlError::PlanGeneration`].
    fn build(&mut self, app_id: &str, description: &str) -> CrawlResult<CoveragePlan>;

    fn revise(&mut self, request: &RevisionRequest<'_>) -> CrawlResult<Section>;
}

impl<P: PlanBuilder + ?Sized> PlanBuilder for Box<P> {
    fn build(&mut self, app_id: &str, description: &str) -> CrawlResult<CoveragePlan> {
        (**self).build(app_id, description)
    }

    fn revise(&mut self, request: &RevisionRequest<'_>) -> CrawlResult<Section> {
        (**self).revise(request)
    }
}

/// Deterministic plan builder over a markdown-like outline.
///
/// ```text
/// # Onboarding
/// - Welcome screen [expect: Welcome, Get Started]
/// - Sign up form (after: welcome-screen)
/// # Success criteria
/// - Every tab visited
/// ```
///
/// A description without headings or list items is read as prose: one flow
/// per sentence in a single `Main` section. Revision cannot invent new flows
/// and returns the section unchanged.
#[derive(Debug, Default, Clone)]
pub struct OutlinePlanBuilder;

impl PlanBuilder for OutlinePlanBuilder {
    #[instrument(skip_all, fields(app_id = %app_id))]
    fn build(&mut self, app_id: &str, description: &str) -> CrawlResult<CoveragePlan> {
        if description.trim().is_empty() {
            return Err(CrawlError::PlanGeneration(
                "app description is empty".to_string(),
            ));
        }

        let outline = parse_outline(description);
        let plan = assemble_plan(app_id, outline.sections, outline.success_criteria)?;
        debug!(
            sections = plan.sections.len(),
            flows = plan.flow_count(),
            "outline plan built"
        );
        Ok(plan)
    }

    fn revise(&mut self, request: &RevisionRequest<'_>) -> CrawlResult<Section> {
        request
            .plan
            .section(request.section)
            .cloned()
            .ok_or_else(|| {
                CrawlError::PlanGeneration(format!("unknown section '{}'", request.section))
            })
    }
}

/// Flow as drafted by a builder, before ids are assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftFlow {
    /// Optional author-chosen key; ids are derived from it when present.
    pub key: Option<String>,
    pub description: String,
    pub expect: Vec<String>,
    /// Keys or ids of flows that must complete first.
    pub after: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftSection {
    pub name: String,
    pub description: String,
    pub flows: Vec<DraftFlow>,
}

/// Assign unique ids to drafted flows, resolve prerequisites, and validate.
///
/// `after` references are matched against flow keys first, then against
/// derived ids.
pub fn assemble_plan(
    app_id: &str,
    drafts: Vec<DraftSection>,
    success_criteria: Vec<String>,
) -> CrawlResult<CoveragePlan> {
    let mut taken = HashSet::new();
    let mut keyed: Vec<(Option<String>, String)> = Vec::new();
    let mut sections = Vec::new();
    let mut pending_after = Vec::new();

    for draft in drafts {
        let mut flows = Vec::new();
        for item in draft.flows {
            let basis = item.key.as_deref().unwrap_or(&item.description);
            let id = unique_slug(basis, &mut taken);
            keyed.push((item.key.clone(), id.clone()));
            let mut flow = Flow::new(id, item.description.trim());
            flow.expect = item.expect;
            pending_after.push(item.after);
            flows.push(flow);
        }
        if !flows.is_empty() {
            sections.push(Section {
                name: draft.name,
                description: draft.description,
                flows,
            });
        }
    }

    let mut after = pending_after.into_iter();
    for flow in sections.iter_mut().flat_map(|section| section.flows.iter_mut()) {
        if let Some(references) = after.next() {
            flow.prerequisites = resolve_after(&keyed, &references);
        }
    }

    let plan = CoveragePlan {
        id: format!("{}-coverage", unique_slug(app_id, &mut HashSet::new())),
        app_id: app_id.to_string(),
        sections,
        success_criteria,
    };

    if plan.is_empty() {
        return Err(CrawlError::PlanGeneration(
            "description yields no actionable flows".to_string(),
        ));
    }
    let errors = validate_plan(&plan);
    if !errors.is_empty() {
        return Err(CrawlError::PlanGeneration(errors.join("; ")));
    }
    Ok(plan)
}

/// Turn a revised section draft into plan flows.
///
/// Keys naming flows already in `plan` keep those ids; other flows get ids
/// unique across the whole plan. Prerequisites resolve as in [`assemble_plan`].
pub fn assemble_section(plan: &CoveragePlan, draft: DraftSection) -> Section {
    let mut taken: HashSet<String> = plan.flows().map(|flow| flow.id.clone()).collect();
    let mut keyed: Vec<(Option<String>, String)> = Vec::new();
    let mut flows = Vec::new();
    let mut pending_after = Vec::new();
    for item in draft.flows {
        let key = item.key.as_deref().map(str::trim).filter(|key| !key.is_empty());
        let id = match key {
            Some(key) if plan.flow(key).is_some() => key.to_string(),
            _ => unique_slug(key.unwrap_or(&item.description), &mut taken),
        };
        keyed.push((key.map(str::to_string), id.clone()));
        let mut flow = Flow::new(id, item.description.trim());
        flow.expect = item.expect;
        pending_after.push(item.after);
        flows.push(flow);
    }
    for (flow, references) in flows.iter_mut().zip(pending_after) {
        flow.prerequisites = resolve_after(&keyed, &references);
    }
    Section {
        name: draft.name,
        description: draft.description,
        flows,
    }
}

fn resolve_after(keyed: &[(Option<String>, String)], references: &[String]) -> Vec<String> {
    references
        .iter()
        .map(|reference| reference.trim())
        .filter(|reference| !reference.is_empty())
        .map(|reference| {
            keyed
                .iter()
                .find(|(key, _)| key.as_deref() == Some(reference))
                .map_or_else(|| reference.to_string(), |(_, id)| id.clone())
        })
        .collect()
}

struct Outline {
    sections: Vec<DraftSection>,
    success_criteria: Vec<String>,
}

fn parse_outline(text: &str) -> Outline {
    let structured = text.lines().any(|line| {
        let line = line.trim();
        line.starts_with('#') || LIST_MARKER.is_match(line)
    });
    if !structured {
        return Outline {
            sections: vec![prose_section(text)],
            success_criteria: Vec::new(),
        };
    }

    let mut sections: Vec<DraftSection> = Vec::new();
    let mut success_criteria = Vec::new();
    let mut in_criteria = false;
    let mut current = None;

    for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(heading) = line.strip_prefix('#') {
            let name = heading.trim_start_matches('#').trim();
            in_criteria = name.to_lowercase().starts_with("success criteria");
            if !in_criteria {
                current = Some(open_section(&mut sections, name));
            }
            continue;
        }

        let item = LIST_MARKER.find(line).map(|marker| &line[marker.end()..]);
        if in_criteria {
            success_criteria.push(item.unwrap_or(line).trim().to_string());
            continue;
        }
        let index = *current.get_or_insert_with(|| open_section(&mut sections, DEFAULT_SECTION));
        let Some(section) = sections.get_mut(index) else {
            continue;
        };
        match item {
            Some(item) => section.flows.push(parse_item(item)),
            None => {
                if !section.description.is_empty() {
                    section.description.push(' ');
                }
                section.description.push_str(line);
            }
        }
    }

    Outline {
        sections,
        success_criteria,
    }
}

/// Index of the section called `name`, creating it if needed. Repeated
/// headings continue the earlier section.
fn open_section(sections: &mut Vec<DraftSection>, name: &str) -> usize {
    let name = if name.is_empty() { DEFAULT_SECTION } else { name };
    if let Some(index) = sections.iter().position(|section| section.name == name) {
        return index;
    }
    sections.push(DraftSection {
        name: name.to_string(),
        description: String::new(),
        flows: Vec::new(),
    });
    sections.len() - 1
}

fn parse_item(item: &str) -> DraftFlow {
    let expect = EXPECT_ANNOTATION
        .captures(item)
        .and_then(|caps| caps.get(1))
        .map(|m| split_list(m.as_str()))
        .unwrap_or_default();
    let after = AFTER_ANNOTATION
        .captures(item)
        .and_then(|caps| caps.get(1))
        .map(|m| split_list(m.as_str()))
        .unwrap_or_default();
    let stripped = EXPECT_ANNOTATION.replace_all(item, "");
    let stripped = AFTER_ANNOTATION.replace_all(&stripped, "");

    DraftFlow {
        key: None,
        description: stripped.trim().to_string(),
        expect,
        after,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

fn prose_section(text: &str) -> DraftSection {
    let flows = text
        .split(['.', '!', '?', '\n'])
        .map(str::trim)
        .filter(|sentence| sentence.chars().any(char::is_alphanumeric))
        .map(|sentence| DraftFlow {
            key: None,
            description: sentence.to_string(),
            expect: Vec::new(),
            after: Vec::new(),
        })
        .collect();
    DraftSection {
        name: DEFAULT_SECTION.to_string(),
        description: String::new(),
        flows,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(description: &str) -> CrawlResult<CoveragePlan> {
        OutlinePlanBuilder.build("com.example.notes", description)
    }

    #[test]
    fn empty_description_fails() {
        let err = build("   \n").expect_err("empty description");
        assert!(matches!(err, CrawlError::PlanGeneration(_)));
    }

    #[test]
    fn outline_sections_flows_and_annotations() {
        let plan = build(
            "# Onboarding\n\
             Screens a new user sees.\n\
             - Welcome screen [expect: Welcome, Get Started]\n\
             - Sign up form (after: welcome-screen)\n\
             # Settings\n\
             1. Dark mode toggle [expect: Dark Mode]\n\
             # Success criteria\n\
             - All tabs visited\n",
        )
        .expect("plan");

        assert_eq!(plan.app_id, "com.example.notes");
        assert_eq!(plan.id, "com-example-notes-coverage");
        assert_eq!(plan.sections.len(), 2);
        let onboarding = &plan.sections[0];
        assert_eq!(onboarding.name, "Onboarding");
        assert_eq!(onboarding.description, "Screens a new user sees.");
        assert_eq!(onboarding.flows[0].id, "welcome-screen");
        assert_eq!(onboarding.flows[0].expect, vec!["Welcome", "Get Started"]);
        assert_eq!(onboarding.flows[1].description, "Sign up form");
        assert_eq!(onboarding.flows[1].prerequisites, vec!["welcome-screen"]);
        assert_eq!(plan.sections[1].flows[0].id, "dark-mode-toggle");
        assert_eq!(plan.success_criteria, vec!["All tabs visited"]);
    }

    #[test]
    fn list_without_heading_goes_to_main_section() {
        let plan = build("- Home\n- Home\n").expect("plan");
        assert_eq!(plan.sections[0].name, DEFAULT_SECTION);
        let ids: Vec<&str> = plan.flows().map(|flow| flow.id.as_str()).collect();
        assert_eq!(ids, vec!["home", "home-2"]);
    }

    #[test]
    fn repeated_heading_continues_section() {
        let plan = build("# Tabs\n- Feed\n# Profile\n- Avatar\n# Tabs\n- Search\n").expect("plan");
        assert_eq!(plan.sections.len(), 2);
        let tabs: Vec<&str> = plan.sections[0].flows.iter().map(|f| f.id.as_str()).collect();
        assert_eq!(tabs, vec!["feed", "search"]);
    }

    #[test]
    fn prose_becomes_one_flow_per_sentence() {
        let plan = build("A notes app. Users can create notes! Is there a trash view?").expect("plan");
        let descriptions: Vec<&str> = plan.flows().map(|flow| flow.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec!["A notes app", "Users can create notes", "Is there a trash view"]
        );
    }

    #[test]
    fn headings_without_items_fail() {
        let err = build("# Settings\nJust prose here.\n").expect_err("no flows");
        assert!(err.to_string().contains("no actionable flows"));
    }

    #[test]
    fn unknown_prerequisite_fails_validation() {
        let err = build("- Profile (after: login)\n").expect_err("unknown prerequisite");
        assert!(err.to_string().contains("unknown prerequisite 'login'"));
    }

    #[test]
    fn revised_section_keeps_known_ids_and_slugs_new_ones() {
        let plan = build("# Checkout\n- Cart\n- Pay (after: cart)\n").expect("plan");
        let section = assemble_section(
            &plan,
            DraftSection {
                name: "Checkout".to_string(),
                description: String::new(),
                flows: vec![
                    DraftFlow {
                        key: Some("pay".to_string()),
                        description: "Pay".to_string(),
                        expect: Vec::new(),
                        after: vec!["cart".to_string()],
                    },
                    DraftFlow {
                        key: Some("cart".to_string()),
                        description: "Cart".to_string(),
                        expect: Vec::new(),
                        after: Vec::new(),
                    },
                    DraftFlow {
                        key: None,
                        description: "Pay with saved card".to_string(),
                        expect: vec!["Visa".to_string()],
                        after: vec!["cart".to_string()],
                    },
                ],
            },
        );
        let ids: Vec<&str> = section.flows.iter().map(|flow| flow.id.as_str()).collect();
        assert_eq!(ids, vec!["pay", "cart", "pay-with-saved-card"]);
        assert_eq!(section.flows[2].prerequisites, vec!["cart"]);
        assert_eq!(section.flows[2].expect, vec!["Visa"]);
    }

    #[test]
    fn revise_returns_section_unchanged() {
        let mut builder = OutlinePlanBuilder;
        let plan = builder.build("app", "# Main\n- Home\n").expect("plan");
        let report = CoverageReport::default();
        let revised = builder
            .revise(&RevisionRequest {
                app_id: "app",
                description: "# Main\n- Home\n",
                plan: &plan,
                section: "Main",
                report: &report,
            })
            .expect("revise");
        assert_eq!(&revised, &plan.sections[0]);
    }
}
