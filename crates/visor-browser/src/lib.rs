//! Controlled-browser abstraction.
//!
//! [`BrowserSession`] is the capability set the streaming core needs from a
//! browser; [`CdpSession`] implements it over the DevTools protocol via
//! `tokio-tungstenite`. [`RecorderBridge`] injects the in-page recorder and
//! re-injects it after navigations.

pub mod cdp;
pub mod chrome;
pub mod error;
pub mod handle;
pub mod recorder;

pub use cdp::CdpSession;
pub use chrome::{find_chrome, BrowserVariant, LaunchOptions};
pub use error::BrowserError;
pub use handle::{BridgeHandler, BrowserSession, EnvMetadata, MouseButton, NavigationHandler, Viewport};
pub use recorder::{RecorderBridge, RecorderBridgeConfig, BRIDGE_FUNCTION};
