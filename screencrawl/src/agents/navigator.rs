//! Navigator agent: asks a model which device actions to try next.

use anyhow::Result;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::explore::navigator::{NavigationRequest, Navigator};
use crate::io::device::{DeviceAction, Locator, PhysicalButton, SwipeDirection};
use crate::io::executor::Executor;
use crate::io::prompt::{NavigatorPrompt, PromptBuilder};

use super::{AgentCall, AgentSettings, run_agent};

const NAVIGATOR_OUTPUT_SCHEMA: &str = include_str!("../../schemas/navigator_output.schema.json");

/// Upper bound on actions taken from one proposal.
const MAX_ACTIONS: usize = 4;

#[derive(Debug, Deserialize)]
struct NavigatorOutput {
    actions: Vec<ActionOutput>,
}

#[derive(Debug, Deserialize)]
struct ActionOutput {
    kind: String,
    target: String,
    text: String,
}

impl ActionOutput {
    fn into_action(self) -> Option<DeviceAction> {
        let target = self.target.trim();
        if target.is_empty() {
            return None;
        }
        match self.kind.as_str() {
            "tap" => Some(DeviceAction::Tap {
                locator: Locator::accessibility_id(target),
            }),
            "type_text" => Some(DeviceAction::TypeText {
                locator: Locator::accessibility_id(target),
                text: self.text,
            }),
            "navigate" => Some(DeviceAction::Navigate {
                url: target.to_string(),
            }),
            "swipe" => SwipeDirection::ALL
                .into_iter()
                .find(|direction| direction.as_str().eq_ignore_ascii_case(target))
                .map(|direction| DeviceAction::Swipe { direction }),
            "press_button" => parse_button(target).map(|button| DeviceAction::PressButton { button }),
            _ => None,
        }
    }
}

fn parse_button(name: &str) -> Option<PhysicalButton> {
    match name.to_ascii_lowercase().as_str() {
        "home" => Some(PhysicalButton::Home),
        "volume_up" => Some(PhysicalButton::VolumeUp),
        "volume_down" => Some(PhysicalButton::VolumeDown),
        "power" => Some(PhysicalButton::Power),
        _ => None,
    }
}

pub struct AgentNavigator<E> {
    executor: E,
    settings: AgentSettings,
    calls: u32,
}

impl<E: Executor> AgentNavigator<E> {
    pub fn new(executor: E, settings: AgentSettings) -> Self {
        Self {
            executor,
            settings,
            calls: 0,
        }
    }
}

impl<E: Executor> Navigator for AgentNavigator<E> {
    fn propose(&mut self, request: &NavigationRequest<'_>) -> Result<Vec<DeviceAction>> {
        let prompt = PromptBuilder::new(self.settings.prompt_budget_bytes)?.navigator(
            &NavigatorPrompt {
                app_id: request.app_id,
                flow: request.flow,
                labels: request.labels,
                fingerprint: request.fingerprint.short(),
                attempt: request.attempt,
                feedback: request.feedback,
                page_source: request.page_source,
                max_actions: MAX_ACTIONS,
            },
        )?;
        self.calls += 1;
        let output: NavigatorOutput = run_agent(
            &self.executor,
            &self.settings,
            AgentCall {
                agent: "navigator",
                schema: NAVIGATOR_OUTPUT_SCHEMA,
                seq: self.calls,
                prompt,
                deadline: request.deadline,
            },
        )?;

        let mut actions = Vec::new();
        for raw in output.actions.into_iter().take(MAX_ACTIONS) {
            let kind = raw.kind.clone();
            match raw.into_action() {
                Some(action) => actions.push(action),
                None => warn!(kind = %kind, "skipping unusable navigator action"),
            }
        }
        debug!(flow = %request.flow.id, actions = actions.len(), "navigator proposal");
        Ok(actions)
    }
}
