//! Coverage plan model: sections of flows the session must find evidence for.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::core::types::FlowStatus;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoveragePlan {
    pub id: String,
    pub app_id: String,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Section {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub flows: Vec<Flow>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flow {
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub status: FlowStatus,
    /// Flow ids that must be completed before this flow is eligible.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Element labels whose joint presence identifies the target screen.
    #[serde(default)]
    pub expect: Vec<String>,
    /// Blocked flow counted toward coverage after its section was replanned.
    #[serde(default)]
    pub waived: bool,
}

impl Flow {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            status: FlowStatus::Pending,
            prerequisites: Vec::new(),
            expect: Vec::new(),
            waived: false,
        }
    }
}

impl CoveragePlan {
    /// All flows in plan order (section order, then flow order).
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.sections.iter().flat_map(|section| section.flows.iter())
    }

    pub fn flow_count(&self) -> usize {
        self.sections.iter().map(|section| section.flows.len()).sum()
    }

    pub fn flow(&self, id: &str) -> Option<&Flow> {
        self.flows().find(|flow| flow.id == id)
    }

    pub fn flow_mut(&mut self, id: &str) -> Option<&mut Flow> {
        self.sections
            .iter_mut()
            .flat_map(|section| section.flows.iter_mut())
            .find(|flow| flow.id == id)
    }

    /// Name of the section that owns `flow_id`.
    pub fn section_of(&self, flow_id: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|section| section.flows.iter().any(|flow| flow.id == flow_id))
            .map(|section| section.name.as_str())
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections.iter_mut().find(|section| section.name == name)
    }

    pub fn flow_ids(&self) -> HashSet<&str> {
        self.flows().map(|flow| flow.id.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.flow_count() == 0
    }
}

/// Derive a stable kebab-case id from free text, unique against `taken`.
///
/// The id is inserted into `taken` before returning.
pub fn unique_slug(text: &str, taken: &mut HashSet<String>) -> String {
    let mut base = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .take(6)
    {
        if !base.is_empty() {
            base.push('-');
        }
        base.push_str(&word.to_ascii_lowercase());
    }
    if base.is_empty() {
        base.push_str("flow");
    }

    let mut candidate = base.clone();
    let mut suffix = 2u32;
    while taken.contains(&candidate) {
        candidate = format!("{base}-{suffix}");
        suffix += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{flow, plan_with_sections, section};

    #[test]
    fn flows_iterate_in_plan_order() {
        let plan = plan_with_sections(vec![
            section("Onboarding", vec![flow("welcome"), flow("signup")]),
            section("Settings", vec![flow("theme")]),
        ]);
        let ids: Vec<&str> = plan.flows().map(|flow| flow.id.as_str()).collect();
        assert_eq!(ids, vec!["welcome", "signup", "theme"]);
        assert_eq!(plan.section_of("theme"), Some("Settings"));
        assert_eq!(plan.flow_count(), 3);
    }

    #[test]
    fn unique_slug_dedupes_with_suffix() {
        let mut taken = HashSet::new();
        assert_eq!(unique_slug("Open the Settings tab", &mut taken), "open-the-settings-tab");
        assert_eq!(unique_slug("open the settings tab!", &mut taken), "open-the-settings-tab-2");
        assert_eq!(unique_slug("???", &mut taken), "flow");
    }

    #[test]
    fn flow_status_defaults_to_pending_when_missing() {
        let flow: Flow =
            serde_json::from_str(r#"{"id":"a","description":"A"}"#).expect("parse flow");
        assert_eq!(flow.status, FlowStatus::Pending);
        assert!(flow.prerequisites.is_empty());
        assert!(!flow.waived);
    }
}
