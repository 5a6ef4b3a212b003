//! Action proposal for the explorer.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::Result;

use crate::core::classifier::keywords;
use crate::core::fingerprint::Fingerprint;
use crate::core::plan::Flow;
use crate::io::device::{DeviceAction, Locator, PhysicalButton, SwipeDirection};

/// What a navigator sees when asked for the next actions.
#[derive(Debug, Clone, Copy)]
pub struct NavigationRequest<'a> {
    pub app_id: &'a str,
    pub flow: &'a Flow,
    pub page_source: &'a str,
    pub labels: &'a [String],
    pub fingerprint: &'a Fingerprint,
    /// Steps already spent on this flow in the session.
    pub attempt: u32,
    /// Feedback from the latest coverage report.
    pub feedback: Option<&'a str>,
    pub deadline: Instant,
}

/// Proposes a short sequence of device actions that should move the app
/// toward the flow's target screen. An empty list means "nothing to try".
pub trait Navigator {
    fn propose(&mut self, request: &NavigationRequest<'_>) -> Result<Vec<DeviceAction>>;
}

impl<N: Navigator + ?Sized> Navigator for Box<N> {
    fn propose(&mut self, request: &NavigationRequest<'_>) -> Result<Vec<DeviceAction>> {
        (**self).propose(request)
    }
}

/// Rule-based navigator.
///
/// Order of preference on the current screen:
/// 1. an untried element whose label matches the flow's expect labels or
///    description keywords;
/// 2. a deep link named in the flow description, on the first attempt;
/// 3. any other untried element (breadth-first discovery);
/// 4. a swipe, cycling directions, with a home press every fifth attempt.
///
/// Tried elements are remembered per (flow, screen) pair.
#[derive(Debug, Default)]
pub struct HeuristicNavigator {
    tried: HashSet<(String, Fingerprint, String)>,
}

impl HeuristicNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    fn untried<'a>(&self, request: &NavigationRequest<'a>) -> Vec<&'a String> {
        request
            .labels
            .iter()
            .filter(|label| {
                !self.tried.contains(&(
                    request.flow.id.clone(),
                    request.fingerprint.clone(),
                    (*label).clone(),
                ))
            })
            .collect()
    }
}

impl Navigator for HeuristicNavigator {
    fn propose(&mut self, request: &NavigationRequest<'_>) -> Result<Vec<DeviceAction>> {
        let wanted = flow_terms(request.flow);
        let untried = self.untried(request);

        let matching = untried
            .iter()
            .find(|label| keywords(label.as_str()).iter().any(|word| wanted.contains(word)))
            .copied();
        let link = deep_link(&request.flow.description).filter(|_| request.attempt == 0);
        let pick = matching.or_else(|| {
            if link.is_some() {
                None
            } else {
                untried.first().copied()
            }
        });

        if let Some(label) = pick {
            self.tried.insert((
                request.flow.id.clone(),
                request.fingerprint.clone(),
                label.clone(),
            ));
            return Ok(vec![DeviceAction::Tap {
                locator: Locator::accessibility_id(label.as_str()),
            }]);
        }
        if let Some(url) = link {
            return Ok(vec![DeviceAction::Navigate { url }]);
        }

        let slot = request.attempt % 5;
        if slot == 4 {
            return Ok(vec![DeviceAction::PressButton {
                button: PhysicalButton::Home,
            }]);
        }
        Ok(vec![DeviceAction::Swipe {
            direction: SwipeDirection::ALL[slot as usize],
        }])
    }
}

fn flow_terms(flow: &Flow) -> HashSet<String> {
    let mut terms = keywords(&flow.description);
    for label in &flow.expect {
        terms.extend(keywords(label));
    }
    terms
}

fn deep_link(description: &str) -> Option<String> {
    description
        .split_whitespace()
        .map(|word| word.trim_matches(|c: char| matches!(c, ',' | '.' | ')' | '(' | '"' | '\'')))
        .find(|word| word.contains("://"))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request<'a>(
        flow: &'a Flow,
        labels: &'a [String],
        fingerprint: &'a Fingerprint,
        attempt: u32,
    ) -> NavigationRequest<'a> {
        NavigationRequest {
            app_id: "com.example",
            flow,
            page_source: "<hierarchy/>",
            labels,
            fingerprint,
            attempt,
            feedback: None,
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    fn labels(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| (*item).to_string()).collect()
    }

    fn tap(label: &str) -> DeviceAction {
        DeviceAction::Tap {
            locator: Locator::accessibility_id(label),
        }
    }

    #[test]
    fn prefers_matching_label_then_other_untried_labels() {
        let flow = Flow::new("settings", "Open notification settings");
        let screen = labels(&["Home", "Profile", "Settings"]);
        let fingerprint = Fingerprint::of("home");
        let mut navigator = HeuristicNavigator::new();

        let first = navigator
            .propose(&request(&flow, &screen, &fingerprint, 0))
            .expect("propose");
        assert_eq!(first, vec![tap("Settings")]);

        let second = navigator
            .propose(&request(&flow, &screen, &fingerprint, 1))
            .expect("propose");
        assert_eq!(second, vec![tap("Home")]);
    }

    #[test]
    fn expect_labels_drive_matching() {
        let mut flow = Flow::new("theme", "Change how it looks");
        flow.expect = vec!["Appearance".to_string()];
        let screen = labels(&["Account", "Appearance"]);
        let fingerprint = Fingerprint::of("settings");
        let actions = HeuristicNavigator::new()
            .propose(&request(&flow, &screen, &fingerprint, 0))
            .expect("propose");
        assert_eq!(actions, vec![tap("Appearance")]);
    }

    #[test]
    fn deep_link_is_tried_before_unrelated_taps() {
        let flow = Flow::new("about", "Open app://about (deep link)");
        let screen = labels(&["Feed"]);
        let fingerprint = Fingerprint::of("home");
        let actions = HeuristicNavigator::new()
            .propose(&request(&flow, &screen, &fingerprint, 0))
            .expect("propose");
        assert_eq!(
            actions,
            vec![DeviceAction::Navigate {
                url: "app://about".to_string()
            }]
        );
    }

    #[test]
    fn falls_back_to_swipes_and_home() {
        let flow = Flow::new("hidden", "Find the hidden drawer");
        let fingerprint = Fingerprint::of("empty");
        let mut navigator = HeuristicNavigator::new();

        let swipe = navigator
            .propose(&request(&flow, &[], &fingerprint, 1))
            .expect("propose");
        assert_eq!(
            swipe,
            vec![DeviceAction::Swipe {
                direction: SwipeDirection::Down
            }]
        );
        let home = navigator
            .propose(&request(&flow, &[], &fingerprint, 4))
            .expect("propose");
        assert_eq!(
            home,
            vec![DeviceAction::PressButton {
                button: PhysicalButton::Home
            }]
        );
    }
}
