//! Browser binary discovery and launch options.

use std::path::PathBuf;

use crate::error::BrowserError;
use crate::handle::Viewport;

/// Headless or headed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrowserVariant {
    /// No visible window; the production default.
    Headless,
    /// Visible window for local debugging.
    Headed,
}

impl BrowserVariant {
    /// Pick a variant for the named environment: production runs headless.
    #[must_use]
    pub fn for_environment(environment: &str) -> Self {
        match environment {
            "development" | "local" => Self::Headed,
            _ => Self::Headless,
        }
    }
}

/// Options for launching a controlled browser.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    /// Path to the Chromium/Chrome executable.
    pub binary: PathBuf,
    /// Headless or headed.
    pub variant: BrowserVariant,
    /// Initial window size.
    pub viewport: Viewport,
}

impl LaunchOptions {
    /// Options for a discovered binary with defaults.
    #[must_use]
    pub fn new(binary: PathBuf) -> Self {
        Self {
            binary,
            variant: BrowserVariant::Headless,
            viewport: Viewport::default(),
        }
    }

    /// Command-line arguments for the launch (excluding the debugging port).
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.variant == BrowserVariant::Headless {
            args.push("--headless=new".to_string());
        }
        args.push("--disable-gpu".to_string());
        args.push("--no-sandbox".to_string());
        args.push("--disable-dev-shm-usage".to_string());
        args.push(format!(
            "--window-size={},{}",
            self.viewport.width, self.viewport.height
        ));
        args.push("about:blank".to_string());
        args
    }
}

/// Well-known install locations, checked after `CHROME_PATH`.
const CANDIDATES: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
];

/// Locate a Chromium/Chrome binary.
///
/// # Errors
///
/// Returns [`BrowserError::BinaryNotFound`] when neither `CHROME_PATH` nor a
/// well-known location yields an executable.
pub fn find_chrome() -> Result<PathBuf, BrowserError> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }
    for candidate in CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    Err(BrowserError::BinaryNotFound)
}
