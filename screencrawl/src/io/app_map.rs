//! Offline device backed by a JSON map of screens and transitions.
//!
//! Used by `screencrawl run --app-map` for dry runs and by the integration
//! tests as a device double that behaves like a small real app.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::io::device::{
    ActionCapability, DeviceError, Locator, PhysicalButton, SwipeDirection,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMap {
    pub start: String,
    pub screens: BTreeMap<String, Screen>,
    /// Simulate an unreachable device: every primitive fails with a transport error.
    #[serde(default)]
    pub unreachable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Screen {
    pub title: String,
    #[serde(default)]
    pub elements: Vec<String>,
    /// Element label -> destination screen.
    #[serde(default)]
    pub taps: BTreeMap<String, String>,
    #[serde(default)]
    pub swipes: BTreeMap<SwipeDirection, String>,
    /// Deep link -> destination screen.
    #[serde(default)]
    pub urls: BTreeMap<String, String>,
    #[serde(default)]
    pub screenshot: Option<String>,
}

impl AppMap {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read app map {}", path.display()))?;
        let map: AppMap = serde_json::from_str(&contents)
            .with_context(|| format!("parse app map {}", path.display()))?;
        let errors = map.validate();
        if !errors.is_empty() {
            return Err(anyhow!(
                "invalid app map {}: {}",
                path.display(),
                errors.join("; ")
            ));
        }
        Ok(map)
    }

    /// Check that the start screen and every transition target exist.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !self.screens.contains_key(&self.start) {
            errors.push(format!("start screen '{}' is not defined", self.start));
        }
        for (id, screen) in &self.screens {
            let targets = screen
                .taps
                .values()
                .chain(screen.swipes.values())
                .chain(screen.urls.values());
            for target in targets {
                if !self.screens.contains_key(target) {
                    errors.push(format!("{id}: transition to unknown screen '{target}'"));
                }
            }
        }
        errors
    }
}

/// [`ActionCapability`] over an [`AppMap`].
///
/// Taps match element labels case-insensitively. Tapping a listed element or
/// the title with no transition, or swiping where no transition exists, leaves the
/// screen unchanged. Home returns to the start screen.
#[derive(Debug)]
pub struct AppMapDevice {
    map: AppMap,
    current: Option<String>,
    released: bool,
    calls: usize,
}

impl AppMapDevice {
    pub fn new(map: AppMap) -> Self {
        Self {
            map,
            current: None,
            released: false,
            calls: 0,
        }
    }

    pub fn current_screen(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Primitive calls received so far, including failed ones.
    pub fn calls(&self) -> usize {
        self.calls
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn connected(&mut self) -> Result<&Screen, DeviceError> {
        self.calls += 1;
        if self.map.unreachable {
            return Err(DeviceError::Transport("device unreachable".to_string()));
        }
        if self.released {
            return Err(DeviceError::Transport("device released".to_string()));
        }
        let current = self
            .current
            .as_deref()
            .ok_or_else(|| DeviceError::Transport("app not launched".to_string()))?;
        self.map
            .screens
            .get(current)
            .ok_or_else(|| DeviceError::Transport(format!("unknown screen '{current}'")))
    }

    fn go(&mut self, target: String) {
        trace!(from = ?self.current, to = %target, "screen transition");
        self.current = Some(target);
    }
}

impl ActionCapability for AppMapDevice {
    fn launch_app(&mut self, app_id: &str) -> Result<(), DeviceError> {
        self.calls += 1;
        if self.map.unreachable {
            return Err(DeviceError::Transport("device unreachable".to_string()));
        }
        debug!(app_id, start = %self.map.start, "launching mapped app");
        self.released = false;
        self.current = Some(self.map.start.clone());
        Ok(())
    }

    fn tap(&mut self, locator: &Locator) -> Result<(), DeviceError> {
        let screen = self.connected()?;
        let wanted = locator.value.to_lowercase();
        let transition = screen
            .taps
            .iter()
            .find(|(label, _)| label.to_lowercase() == wanted)
            .map(|(_, target)| target.clone());
        if let Some(target) = transition {
            self.go(target);
            return Ok(());
        }
        if screen.title.to_lowercase() == wanted
            || screen
                .elements
                .iter()
                .any(|element| element.to_lowercase() == wanted)
        {
            return Ok(());
        }
        Err(DeviceError::Target(format!(
            "no element '{}' on screen '{}'",
            locator.value, screen.title
        )))
    }

    fn swipe(&mut self, direction: SwipeDirection) -> Result<(), DeviceError> {
        let screen = self.connected()?;
        if let Some(target) = screen.swipes.get(&direction).cloned() {
            self.go(target);
        }
        Ok(())
    }

    fn type_text(&mut self, locator: &Locator, _text: &str) -> Result<(), DeviceError> {
        let screen = self.connected()?;
        let wanted = locator.value.to_lowercase();
        if screen
            .elements
            .iter()
            .any(|element| element.to_lowercase() == wanted)
        {
            Ok(())
        } else {
            Err(DeviceError::Target(format!(
                "no text field '{}' on screen '{}'",
                locator.value, screen.title
            )))
        }
    }

    fn navigate(&mut self, url: &str) -> Result<(), DeviceError> {
        let screen = self.connected()?;
        match screen.urls.get(url).cloned() {
            Some(target) => {
                self.go(target);
                Ok(())
            }
            None => Err(DeviceError::Target(format!("unhandled url '{url}'"))),
        }
    }

    fn press_button(&mut self, button: PhysicalButton) -> Result<(), DeviceError> {
        self.connected()?;
        if button == PhysicalButton::Home {
            let start = self.map.start.clone();
            self.go(start);
        }
        Ok(())
    }

    fn get_page_source(&mut self) -> Result<String, DeviceError> {
        let screen = self.connected()?;
        Ok(render_page_source(screen))
    }

    fn capture_screenshot(&mut self) -> Result<String, DeviceError> {
        let screenshot = self.connected()?.screenshot.clone();
        let current = self.current.clone().unwrap_or_default();
        Ok(screenshot.unwrap_or_else(|| format!("appmap://{current}")))
    }

    fn release(&mut self) -> Result<(), DeviceError> {
        self.calls += 1;
        self.released = true;
        self.current = None;
        Ok(())
    }
}

/// Render a screen as an XCUITest-style hierarchy with synthetic geometry.
fn render_page_source(screen: &Screen) -> String {
    let mut buf = String::from("<hierarchy>\n");
    let _ = writeln!(
        buf,
        r#"  <StaticText name="{}" label="{}" x="0" y="0" width="390" height="44"/>"#,
        escape_attr(&screen.title),
        escape_attr(&screen.title)
    );
    for (index, element) in screen.elements.iter().enumerate() {
        let _ = writeln!(
            buf,
            r#"  <Button name="{}" label="{}" x="16" y="{}" width="358" height="44" index="{}"/>"#,
            escape_attr(element),
            escape_attr(element),
            60 + index * 52,
            index
        );
    }
    buf.push_str("</hierarchy>\n");
    buf
}

fn escape_attr(value: &str) -> Cow<'_, str> {
    quick_xml::escape::escape(value)
}
