//! The browser capability set the streaming core depends on.
//!
//! Everything above this trait (session manager, workflow runner, control
//! channel) talks to the browser only through [`BrowserSession`], so tests
//! substitute a mock and the CDP driver stays swappable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BrowserError;
use visor_store::{Cookie, OriginState, StorageStateBlob};

/// Callback invoked with the raw payload string a page bridge received.
pub type BridgeHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Callback invoked with the new URL after a main-frame navigation.
pub type NavigationHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Mouse button for input dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MouseButton {
    /// Primary button.
    #[default]
    Left,
    /// Middle button / wheel press.
    Middle,
    /// Secondary button.
    Right,
}

impl MouseButton {
    /// Protocol string for this button.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Middle => "middle",
            Self::Right => "right",
        }
    }

    /// Parse a wire string; unknown values fall back to `Left`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "middle" => Self::Middle,
            "right" => Self::Right,
            _ => Self::Left,
        }
    }
}

/// Browser viewport dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    /// Width in CSS pixels.
    pub width: u32,
    /// Height in CSS pixels.
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 800,
        }
    }
}

/// Environment fingerprint captured alongside storage state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvMetadata {
    /// Browser user agent.
    pub user_agent: String,
    /// IANA timezone of the page.
    pub timezone: String,
    /// Viewport at capture time.
    pub viewport: Option<Viewport>,
    /// `navigator.languages`.
    #[serde(default)]
    pub languages: Vec<String>,
    /// `window.devicePixelRatio`.
    pub device_pixel_ratio: f64,
}

/// A controlled browser session.
///
/// All commands are serialized by the implementation's internal queue, so the
/// workflow runner and a live control channel may submit concurrently.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate the page to `url`.
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// URL of the current page, if one has loaded.
    fn current_url(&self) -> Option<String>;

    /// Register a handler for main-frame navigations.
    fn on_frame_navigated(&self, handler: NavigationHandler);

    /// Evaluate a script in the page, returning its value.
    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError>;

    /// Bind a host function callable from the page as `window.<name>(payload)`.
    async fn expose_bridge(&self, name: &str, handler: BridgeHandler)
        -> Result<(), BrowserError>;

    /// All cookies visible to the session.
    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError>;

    /// Local storage of the current origin.
    ///
    /// Extraction runs in-page and is scoped to the origin that is current at
    /// call time; cross-origin local storage is not captured.
    async fn extract_local_storage(&self) -> Result<Vec<OriginState>, BrowserError>;

    /// Environment fingerprint of the page.
    async fn env_metadata(&self) -> Result<EnvMetadata, BrowserError>;

    /// Restore cookies (and, where the origin is current, local storage)
    /// from a previously captured blob.
    async fn restore_storage_state(&self, blob: &StorageStateBlob) -> Result<(), BrowserError>;

    /// Move the mouse to (x, y).
    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BrowserError>;

    /// Press a mouse button at the current position.
    async fn mouse_down(&self, button: MouseButton) -> Result<(), BrowserError>;

    /// Release a mouse button.
    async fn mouse_up(&self, button: MouseButton) -> Result<(), BrowserError>;

    /// Click at (x, y).
    async fn mouse_click(&self, x: f64, y: f64, button: MouseButton) -> Result<(), BrowserError>;

    /// Double-click at (x, y).
    async fn mouse_dblclick(&self, x: f64, y: f64) -> Result<(), BrowserError>;

    /// Scroll by (delta_x, delta_y) at (x, y).
    async fn mouse_wheel(&self, delta_x: f64, delta_y: f64, x: f64, y: f64)
        -> Result<(), BrowserError>;

    /// Press and release a key (used for printable characters).
    async fn keyboard_press(&self, key: &str) -> Result<(), BrowserError>;

    /// Hold a key down (named keys).
    async fn keyboard_down(&self, key: &str) -> Result<(), BrowserError>;

    /// Release a key.
    async fn keyboard_up(&self, key: &str) -> Result<(), BrowserError>;

    /// Click the first element matching a CSS selector.
    async fn click_selector(&self, selector: &str) -> Result<(), BrowserError>;

    /// Fill an input element with a value, firing input/change events.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError>;

    /// Wait for an element to appear.
    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<(), BrowserError>;

    /// Close the browser.
    async fn close(&self) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mouse_button_strings() {
        assert_eq!(MouseButton::Left.as_str(), "left");
        assert_eq!(MouseButton::Middle.as_str(), "middle");
        assert_eq!(MouseButton::Right.as_str(), "right");
    }

    #[test]
    fn mouse_button_parse_defaults_left() {
        assert_eq!(MouseButton::parse("right"), MouseButton::Right);
        assert_eq!(MouseButton::parse("anything"), MouseButton::Left);
    }

    #[test]
    fn env_metadata_wire_shape() {
        let meta = EnvMetadata {
            user_agent: "Mozilla/5.0".into(),
            timezone: "Europe/Berlin".into(),
            viewport: Some(Viewport::default()),
            languages: vec!["en-US".into()],
            device_pixel_ratio: 2.0,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["userAgent"], "Mozilla/5.0");
        assert_eq!(json["devicePixelRatio"], 2.0);
        assert_eq!(json["viewport"]["width"], 1280);
    }

    #[test]
    fn default_viewport() {
        let v = Viewport::default();
        assert_eq!((v.width, v.height), (1280, 800));
    }
}
