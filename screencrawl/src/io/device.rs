//! Device action capability consumed by the explorer.
//!
//! The [`ActionCapability`] trait is the only path to the device. Real
//! automation backends (Appium, adb, simulators) implement it outside this
//! crate; [`crate::io::app_map::AppMapDevice`] implements it over a JSON map
//! for dry runs and tests.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by a device backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The device or automation server could not be reached.
    #[error("device transport failed: {0}")]
    Transport(String),
    /// The locator or target does not exist on the current screen.
    #[error("target not found: {0}")]
    Target(String),
}

impl DeviceError {
    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceError::Transport(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocatorStrategy {
    #[default]
    AccessibilityId,
    Xpath,
    Name,
    ClassName,
}

/// Element locator; the strategy defaults to accessibility id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    #[serde(default)]
    pub strategy: LocatorStrategy,
    pub value: String,
}

impl Locator {
    pub fn accessibility_id(value: impl Into<String>) -> Self {
        Self {
            strategy: LocatorStrategy::AccessibilityId,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

impl SwipeDirection {
    pub const ALL: [SwipeDirection; 4] = [
        SwipeDirection::Up,
        SwipeDirection::Down,
        SwipeDirection::Left,
        SwipeDirection::Right,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SwipeDirection::Up => "up",
            SwipeDirection::Down => "down",
            SwipeDirection::Left => "left",
            SwipeDirection::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysicalButton {
    Home,
    VolumeUp,
    VolumeDown,
    Power,
}

/// One navigation primitive, as proposed by a navigator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceAction {
    Tap { locator: Locator },
    Swipe { direction: SwipeDirection },
    TypeText { locator: Locator, text: String },
    Navigate { url: String },
    PressButton { button: PhysicalButton },
}

/// Atomic device primitives.
///
/// Methods take `&mut self`: a session owns its device exclusively, so no two
/// actions are ever in flight against the same device.
pub trait ActionCapability {
    fn launch_app(&mut self, app_id: &str) -> Result<(), DeviceError>;
    fn tap(&mut self, locator: &Locator) -> Result<(), DeviceError>;
    fn swipe(&mut self, direction: SwipeDirection) -> Result<(), DeviceError>;
    fn type_text(&mut self, locator: &Locator, text: &str) -> Result<(), DeviceError>;
    fn navigate(&mut self, url: &str) -> Result<(), DeviceError>;
    fn press_button(&mut self, button: PhysicalButton) -> Result<(), DeviceError>;
    /// Structural snapshot (XML) of the current screen.
    fn get_page_source(&mut self) -> Result<String, DeviceError>;
    /// Capture the current screen; returns an opaque reference (path or URI).
    fn capture_screenshot(&mut self) -> Result<String, DeviceError>;
    /// Release the device at session end.
    fn release(&mut self) -> Result<(), DeviceError>;
}

impl<D: ActionCapability + ?Sized> ActionCapability for Box<D> {
    fn launch_app(&mut self, app_id: &str) -> Result<(), DeviceError> {
        (**self).launch_app(app_id)
    }
    fn tap(&mut self, locator: &Locator) -> Result<(), DeviceError> {
        (**self).tap(locator)
    }
    fn swipe(&mut self, direction: SwipeDirection) -> Result<(), DeviceError> {
        (**self).swipe(direction)
    }
    fn type_text(&mut self, locator: &Locator, text: &str) -> Result<(), DeviceError> {
        (**self).type_text(locator, text)
    }
    fn navigate(&mut self, url: &str) -> Result<(), DeviceError> {
        (**self).navigate(url)
    }
    fn press_button(&mut self, button: PhysicalButton) -> Result<(), DeviceError> {
        (**self).press_button(button)
    }
    fn get_page_source(&mut self) -> Result<String, DeviceError> {
        (**self).get_page_source()
    }
    fn capture_screenshot(&mut self) -> Result<String, DeviceError> {
        (**self).capture_screenshot()
    }
    fn release(&mut self) -> Result<(), DeviceError> {
        (**self).release()
    }
}

/// Dispatch a navigation action to the matching primitive.
pub fn perform<D: ActionCapability + ?Sized>(
    device: &mut D,
    action: &DeviceAction,
) -> Result<(), DeviceError> {
    match action {
        DeviceAction::Tap { locator } => device.tap(locator),
        DeviceAction::Swipe { direction } => device.swipe(*direction),
        DeviceAction::TypeText { locator, text } => device.type_text(locator, text),
        DeviceAction::Navigate { url } => device.navigate(url),
        DeviceAction::PressButton { button } => device.press_button(*button),
    }
}
