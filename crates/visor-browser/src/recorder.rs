//! Recorder bridge: inject the in-page recorder and keep it alive across
//! navigations.
//!
//! The page-side emit function is bound to the `sendRRWebEvent` bridge; the
//! recorder library is loaded from a vendor-bundled path and started with a
//! fixed option set. Navigation detection uses only the browser's
//! `frame_navigated` signal (no polling, no history patching). After a
//! navigation the recorder is re-injected, which restarts it with a fresh
//! FullSnapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::error::BrowserError;
use crate::handle::{BridgeHandler, BrowserSession};

/// Name of the page-side bridge function.
pub const BRIDGE_FUNCTION: &str = "sendRRWebEvent";

/// Default vendored location of the recorder library.
pub const DEFAULT_LIBRARY_URL: &str = "/vendor/rrweb/rrweb.min.js";

/// Recorder bridge configuration.
#[derive(Clone, Debug)]
pub struct RecorderBridgeConfig {
    /// Where the page loads the recorder library from.
    pub library_url: String,
    /// Emit a synthetic progress ping when no event arrives within this
    /// window after attach.
    pub ping_after: Duration,
    /// How long to wait for DOM readiness after a navigation.
    pub dom_ready_timeout: Duration,
}

impl Default for RecorderBridgeConfig {
    fn default() -> Self {
        Self {
            library_url: DEFAULT_LIBRARY_URL.to_string(),
            ping_after: Duration::from_secs(2),
            dom_ready_timeout: Duration::from_secs(10),
        }
    }
}

/// Recorder options applied verbatim at start.
#[must_use]
pub fn recording_options() -> serde_json::Value {
    json!({
        "checkoutEveryNms": 5000,
        "sampling": { "scroll": 100, "media": 400, "input": "last" },
        "slimDOMOptions": { "script": false, "comment": false, "headFavicon": false },
        "maskInputOptions": { "password": true },
    })
}

/// Build the injection script for one attach/re-inject.
#[must_use]
pub fn injection_script(library_url: &str) -> String {
    let options = recording_options().to_string();
    let src = serde_json::to_string(library_url).unwrap_or_default();
    format!(
        r#"(() => {{
    if (window.__visorRecorderStop) {{ return 'recording'; }}
    const begin = () => {{
        if (!window.rrweb || !window.rrweb.record) {{ return; }}
        const options = Object.assign({{
            emit: (event) => {{
                if (window.{BRIDGE_FUNCTION}) {{
                    try {{ window.{BRIDGE_FUNCTION}(JSON.stringify(event)); }} catch (e) {{}}
                }}
            }}
        }}, {options});
        window.__visorRecorderStop = window.rrweb.record(options);
    }};
    if (window.rrweb && window.rrweb.record) {{ begin(); return 'started'; }}
    const tag = document.createElement('script');
    tag.src = {src};
    tag.onload = () => begin();
    (document.head || document.documentElement).appendChild(tag);
    return 'loading';
}})()"#
    )
}

/// Keeps the in-page recorder attached to a browser session.
pub struct RecorderBridge {
    session: Arc<dyn BrowserSession>,
    config: RecorderBridgeConfig,
    ingest: BridgeHandler,
    events_seen: Arc<AtomicBool>,
    degraded: Arc<AtomicBool>,
}

impl RecorderBridge {
    /// Expose the bridge, inject the recorder, and arm navigation
    /// re-injection plus the 2 s progress ping.
    ///
    /// # Errors
    ///
    /// Returns the underlying [`BrowserError`] when the bridge cannot be
    /// exposed or the first injection fails twice.
    pub async fn attach(
        session: Arc<dyn BrowserSession>,
        ingest: BridgeHandler,
        config: RecorderBridgeConfig,
    ) -> Result<Arc<Self>, BrowserError> {
        let events_seen = Arc::new(AtomicBool::new(false));

        let forwarding: BridgeHandler = {
            let events_seen = Arc::clone(&events_seen);
            let ingest = Arc::clone(&ingest);
            Arc::new(move |payload: String| {
                events_seen.store(true, Ordering::Relaxed);
                ingest(payload);
            })
        };
        session
            .expose_bridge(BRIDGE_FUNCTION, forwarding)
            .await?;

        let bridge = Arc::new(Self {
            session: Arc::clone(&session),
            config,
            ingest,
            events_seen,
            degraded: Arc::new(AtomicBool::new(false)),
        });

        bridge.inject_with_retry().await?;

        // Re-inject after every main-frame navigation.
        {
            let bridge = Arc::clone(&bridge);
            session.on_frame_navigated(Arc::new(move |url: String| {
                let bridge = Arc::clone(&bridge);
                let _ = tokio::spawn(async move {
                    bridge.reinject(&url).await;
                });
            }));
        }

        bridge.spawn_progress_ping();
        Ok(bridge)
    }

    /// Whether injection has failed past its retry and events may be sparse.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Whether any recorder event has arrived since the last (re)injection.
    #[must_use]
    pub fn has_seen_events(&self) -> bool {
        self.events_seen.load(Ordering::Relaxed)
    }

    async fn inject_with_retry(&self) -> Result<(), BrowserError> {
        let script = injection_script(&self.config.library_url);
        match self.session.evaluate(&script).await {
            Ok(_) => Ok(()),
            Err(first) => {
                warn!(error = %first, "recorder injection failed, retrying once");
                match self.session.evaluate(&script).await {
                    Ok(_) => Ok(()),
                    Err(second) => {
                        self.degraded.store(true, Ordering::Relaxed);
                        Err(second)
                    }
                }
            }
        }
    }

    async fn reinject(self: &Arc<Self>, url: &str) {
        info!(url, "re-injecting recorder after navigation");
        self.wait_dom_ready().await;
        // The restarted recorder owes us a FullSnapshot; re-arm the ping so
        // silence after this navigation is also surfaced.
        self.events_seen.store(false, Ordering::Relaxed);
        if self.inject_with_retry().await.is_err() {
            warn!(url, "recorder re-injection failed twice, session degraded");
        }
        self.spawn_progress_ping();
    }

    async fn wait_dom_ready(&self) {
        let deadline = tokio::time::Instant::now() + self.config.dom_ready_timeout;
        loop {
            if let Ok(state) = self.session.evaluate("document.readyState").await {
                if matches!(state.as_str(), Some("interactive" | "complete")) {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    fn spawn_progress_ping(self: &Arc<Self>) {
        let bridge = Arc::clone(self);
        let _ = tokio::spawn(async move {
            tokio::time::sleep(bridge.config.ping_after).await;
            if !bridge.has_seen_events() {
                let ping = json!({
                    "type": 6,
                    "data": { "plugin": "visor/progress", "payload": { "waiting": true } },
                    "timestamp": std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                });
                (bridge.ingest)(ping.to_string());
            }
        });
    }
}
