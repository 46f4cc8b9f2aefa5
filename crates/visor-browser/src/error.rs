//! Browser-specific error types.

use thiserror::Error;

/// Errors from browser automation operations.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// Failed to launch the browser process.
    #[error("failed to launch browser: {context}")]
    LaunchFailed {
        /// What went wrong during launch.
        context: String,
    },

    /// Navigation to a URL failed.
    #[error("navigation failed for {url}: {reason}")]
    NavigationFailed {
        /// The URL that failed to load.
        url: String,
        /// Why it failed.
        reason: String,
    },

    /// A browser action failed.
    #[error("{action} failed: {reason}")]
    ActionFailed {
        /// The action that failed (e.g. "evaluate", "dispatch_mouse").
        action: String,
        /// Why it failed.
        reason: String,
    },

    /// Browser executable not found on the system.
    #[error("browser not found — install Chromium or set CHROME_PATH")]
    BinaryNotFound,

    /// Operation timed out.
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout {
        /// How long we waited.
        timeout_ms: u64,
        /// What we were waiting for.
        context: String,
    },

    /// DevTools protocol error.
    #[error("CDP error: {0}")]
    Cdp(String),
}
