//! CDP browser session — thin client over `tokio-tungstenite`.
//!
//! Only the protocol surface the streaming core needs is implemented, not
//! the whole of CDP. Commands flow through an mpsc channel into a handler
//! loop that owns the WebSocket; responses come back over oneshots keyed by
//! command id. Protocol events (`Page.frameNavigated`,
//! `Runtime.bindingCalled`) are routed to registered handlers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::chrome::LaunchOptions;
use crate::error::BrowserError;
use crate::handle::{
    BridgeHandler, BrowserSession, EnvMetadata, MouseButton, NavigationHandler,
};
use visor_store::{Cookie, OriginState};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type PendingTx = oneshot::Sender<Result<Value, String>>;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

struct CdpCommand {
    method: String,
    params: Value,
    response_tx: PendingTx,
}

/// State shared between the session handle and the WS handler loop.
#[derive(Default)]
struct CdpShared {
    bindings: RwLock<HashMap<String, BridgeHandler>>,
    nav_handlers: RwLock<Vec<NavigationHandler>>,
    current_url: RwLock<Option<String>>,
}

/// A single CDP browser session.
pub struct CdpSession {
    cmd_tx: mpsc::Sender<CdpCommand>,
    shared: Arc<CdpShared>,
    chrome_process: Mutex<Option<Child>>,
    _handler: JoinHandle<()>,
}

impl CdpSession {
    /// Launch a browser and connect to its page over CDP.
    ///
    /// # Errors
    ///
    /// Returns [`BrowserError::LaunchFailed`] when the process does not
    /// start, exits early, or never exposes a DevTools endpoint.
    pub async fn launch(options: &LaunchOptions) -> Result<Self, BrowserError> {
        let port = free_port()?;

        let mut child = Command::new(&options.binary)
            .args(options.args())
            .arg(format!("--remote-debugging-port={port}"))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BrowserError::LaunchFailed {
                context: e.to_string(),
            })?;

        let ws_url = wait_for_ws_url(port, &mut child).await?;

        let (ws, _) = connect_async(&ws_url)
            .await
            .map_err(|e| BrowserError::LaunchFailed {
                context: format!("WebSocket connect: {e}"),
            })?;

        let shared = Arc::new(CdpShared::default());
        let (cmd_tx, cmd_rx) = mpsc::channel::<CdpCommand>(64);
        let handler = tokio::spawn(cdp_handler_loop(ws, cmd_rx, Arc::clone(&shared)));

        let session = Self {
            cmd_tx,
            shared,
            chrome_process: Mutex::new(Some(child)),
            _handler: handler,
        };

        for domain in ["Page.enable", "Runtime.enable", "Network.enable"] {
            let _ = session.send_cdp(domain, json!({})).await?;
        }
        Ok(session)
    }

    async fn send_cdp(&self, method: &str, params: Value) -> Result<Value, BrowserError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CdpCommand {
                method: method.into(),
                params,
                response_tx: tx,
            })
            .await
            .map_err(|_| BrowserError::Cdp("handler closed".into()))?;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, rx)
            .await
            .map_err(|_| BrowserError::Timeout {
                timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
                context: format!("CDP {method}"),
            })?
            .map_err(|_| BrowserError::Cdp("response dropped".into()))?;

        result.map_err(BrowserError::Cdp)
    }

    async fn dispatch_key(&self, kind: &str, key: &str, text: Option<&str>) -> Result<(), BrowserError> {
        let mut params = json!({ "type": kind, "key": key });
        if let Some(text) = text {
            params["text"] = Value::from(text);
        }
        let _ = self.send_cdp("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    async fn ensure_element_exists(&self, selector: &str) -> Result<(), BrowserError> {
        let js = format!(
            "document.querySelector({}) !== null",
            serde_json::to_string(selector).unwrap_or_default(),
        );
        let val = self.evaluate(&js).await?;
        if val.as_bool() != Some(true) {
            return Err(BrowserError::ActionFailed {
                action: "query".into(),
                reason: format!("no element matches {selector}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BrowserSession for CdpSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let _ = self
            .send_cdp("Page.navigate", json!({ "url": url }))
            .await
            .map_err(|e| BrowserError::NavigationFailed {
                url: url.into(),
                reason: e.to_string(),
            })?;

        // Poll readiness rather than racing the load event.
        for _ in 0..100 {
            if let Ok(state) = self.evaluate("document.readyState").await {
                if state.as_str() == Some("complete") || state.as_str() == Some("interactive") {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        *self.shared.current_url.write() = Some(url.to_string());
        Ok(())
    }

    fn current_url(&self) -> Option<String> {
        self.shared.current_url.read().clone()
    }

    fn on_frame_navigated(&self, handler: NavigationHandler) {
        self.shared.nav_handlers.write().push(handler);
    }

    async fn evaluate(&self, script: &str) -> Result<Value, BrowserError> {
        let result = self
            .send_cdp(
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(exception) = result.get("exceptionDetails") {
            let msg = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("evaluation error");
            return Err(BrowserError::ActionFailed {
                action: "evaluate".into(),
                reason: msg.into(),
            });
        }
        Ok(result["result"]["value"].clone())
    }

    async fn expose_bridge(
        &self,
        name: &str,
        handler: BridgeHandler,
    ) -> Result<(), BrowserError> {
        let _ = self
            .shared
            .bindings
            .write()
            .insert(name.to_string(), handler);
        let _ = self
            .send_cdp("Runtime.addBinding", json!({ "name": name }))
            .await?;
        Ok(())
    }

    async fn cookies(&self) -> Result<Vec<Cookie>, BrowserError> {
        let result = self.send_cdp("Network.getCookies", json!({})).await?;
        Ok(parse_cdp_cookies(&result))
    }

    async fn extract_local_storage(&self) -> Result<Vec<OriginState>, BrowserError> {
        let value = self
            .evaluate(
                r"(() => {
                    const items = [];
                    for (let i = 0; i < localStorage.length; i++) {
                        const name = localStorage.key(i);
                        items.push({ name, value: localStorage.getItem(name) });
                    }
                    return [{ origin: window.location.origin, localStorage: items }];
                })()",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| BrowserError::ActionFailed {
            action: "extract_local_storage".into(),
            reason: e.to_string(),
        })
    }

    async fn env_metadata(&self) -> Result<EnvMetadata, BrowserError> {
        let value = self
            .evaluate(
                r"({
                    userAgent: navigator.userAgent,
                    timezone: Intl.DateTimeFormat().resolvedOptions().timeZone,
                    viewport: { width: window.innerWidth, height: window.innerHeight },
                    languages: Array.from(navigator.languages || []),
                    devicePixelRatio: window.devicePixelRatio,
                })",
            )
            .await?;
        serde_json::from_value(value).map_err(|e| BrowserError::ActionFailed {
            action: "env_metadata".into(),
            reason: e.to_string(),
        })
    }

    async fn restore_storage_state(
        &self,
        blob: &visor_store::StorageStateBlob,
    ) -> Result<(), BrowserError> {
        for cookie in &blob.cookies {
            let mut params = json!({
                "name": cookie.name,
                "value": cookie.value,
                "domain": cookie.domain,
                "path": cookie.path,
                "httpOnly": cookie.http_only,
                "secure": cookie.secure,
            });
            if let Some(expires) = cookie.expires {
                params["expires"] = Value::from(expires);
            }
            if let Some(same_site) = &cookie.same_site {
                params["sameSite"] = Value::from(same_site.as_str());
            }
            let _ = self.send_cdp("Network.setCookie", params).await?;
        }
        // Local storage can only be written into the origin that is current;
        // other origins are restored lazily when the page navigates there.
        if let Some(current) = self.current_url() {
            for origin in &blob.origins {
                if !current.starts_with(&origin.origin) {
                    continue;
                }
                for item in &origin.local_storage {
                    let js = format!(
                        "localStorage.setItem({}, {})",
                        serde_json::to_string(&item.name).unwrap_or_default(),
                        serde_json::to_string(&item.value).unwrap_or_default(),
                    );
                    let _ = self.evaluate(&js).await?;
                }
            }
        }
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        let _ = self
            .send_cdp(
                "Input.dispatchMouseEvent",
                json!({ "type": "mouseMoved", "x": x, "y": y }),
            )
            .await?;
        Ok(())
    }

    async fn mouse_down(&self, button: MouseButton) -> Result<(), BrowserError> {
        let _ = self
            .send_cdp(
                "Input.dispatchMouseEvent",
                json!({
                    "type": "mousePressed",
                    "x": 0, "y": 0,
                    "button": button.as_str(),
                    "clickCount": 1,
                }),
            )
            .await?;
        Ok(())
    }

    async fn mouse_up(&self, button: MouseButton) -> Result<(), BrowserError> {
        let _ = self
            .send_cdp(
                "Input.dispatchMouseEvent",
                json!({
                    "type": "mouseReleased",
                    "x": 0, "y": 0,
                    "button": button.as_str(),
                    "clickCount": 1,
                }),
            )
            .await?;
        Ok(())
    }

    async fn mouse_click(
        &self,
        x: f64,
        y: f64,
        button: MouseButton,
    ) -> Result<(), BrowserError> {
        for kind in ["mousePressed", "mouseReleased"] {
            let _ = self
                .send_cdp(
                    "Input.dispatchMouseEvent",
                    json!({
                        "type": kind,
                        "x": x, "y": y,
                        "button": button.as_str(),
                        "clickCount": 1,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn mouse_dblclick(&self, x: f64, y: f64) -> Result<(), BrowserError> {
        for click in 1..=2u32 {
            for kind in ["mousePressed", "mouseReleased"] {
                let _ = self
                    .send_cdp(
                        "Input.dispatchMouseEvent",
                        json!({
                            "type": kind,
                            "x": x, "y": y,
                            "button": "left",
                            "clickCount": click,
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn mouse_wheel(
        &self,
        delta_x: f64,
        delta_y: f64,
        x: f64,
        y: f64,
    ) -> Result<(), BrowserError> {
        let _ = self
            .send_cdp(
                "Input.dispatchMouseEvent",
                json!({
                    "type": "mouseWheel",
                    "x": x, "y": y,
                    "deltaX": delta_x,
                    "deltaY": delta_y,
                }),
            )
            .await?;
        Ok(())
    }

    async fn keyboard_press(&self, key: &str) -> Result<(), BrowserError> {
        let text = if key.chars().count() == 1 {
            Some(key)
        } else {
            None
        };
        self.dispatch_key("keyDown", key, text).await?;
        self.dispatch_key("keyUp", key, None).await
    }

    async fn keyboard_down(&self, key: &str) -> Result<(), BrowserError> {
        self.dispatch_key("keyDown", key, None).await
    }

    async fn keyboard_up(&self, key: &str) -> Result<(), BrowserError> {
        self.dispatch_key("keyUp", key, None).await
    }

    async fn click_selector(&self, selector: &str) -> Result<(), BrowserError> {
        self.ensure_element_exists(selector).await?;
        let js = format!(
            "document.querySelector({}).click()",
            serde_json::to_string(selector).unwrap_or_default(),
        );
        let _ = self.evaluate(&js).await?;
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        self.ensure_element_exists(selector).await?;
        let js = format!(
            r"(() => {{
                const el = document.querySelector({sel});
                el.focus();
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
            }})()",
            sel = serde_json::to_string(selector).unwrap_or_default(),
            val = serde_json::to_string(value).unwrap_or_default(),
        );
        let _ = self.evaluate(&js).await?;
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout_ms: u64) -> Result<(), BrowserError> {
        let js = format!(
            r"new Promise((resolve, reject) => {{
                if (document.querySelector({sel})) return resolve(true);
                const observer = new MutationObserver(() => {{
                    if (document.querySelector({sel})) {{
                        observer.disconnect();
                        resolve(true);
                    }}
                }});
                observer.observe(document.documentElement, {{ childList: true, subtree: true }});
                setTimeout(() => {{ observer.disconnect(); reject(new Error('Timeout')); }}, {t});
            }})",
            sel = serde_json::to_string(selector).unwrap_or_default(),
            t = timeout_ms,
        );
        let _ = tokio::time::timeout(
            Duration::from_millis(timeout_ms + 1000),
            self.evaluate(&js),
        )
        .await
        .map_err(|_| BrowserError::Timeout {
            timeout_ms,
            context: format!("waiting for {selector}"),
        })?
        .map_err(|e| BrowserError::Timeout {
            timeout_ms,
            context: e.to_string(),
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if let Some(mut child) = self.chrome_process.lock().await.take() {
            let _ = child.kill().await;
        }
        Ok(())
    }
}

fn free_port() -> Result<u16, BrowserError> {
    let listener =
        std::net::TcpListener::bind("127.0.0.1:0").map_err(|e| BrowserError::LaunchFailed {
            context: format!("bind port: {e}"),
        })?;
    let port = listener
        .local_addr()
        .map_err(|e| BrowserError::LaunchFailed {
            context: format!("local_addr: {e}"),
        })?
        .port();
    drop(listener);
    Ok(port)
}

/// Wait for the browser to expose its DevTools endpoint, then fetch the
/// page's WebSocket URL from `/json`.
async fn wait_for_ws_url(port: u16, child: &mut Child) -> Result<String, BrowserError> {
    let url = format!("http://127.0.0.1:{port}/json");

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;

        if let Some(status) = child.try_wait().map_err(|e| BrowserError::LaunchFailed {
            context: format!("wait: {e}"),
        })? {
            return Err(BrowserError::LaunchFailed {
                context: format!("browser exited early with {status}"),
            });
        }

        let Ok(resp) = reqwest::get(&url).await else {
            continue;
        };
        let Ok(pages): Result<Vec<Value>, _> = resp.json().await else {
            continue;
        };
        if let Some(page) = pages.first() {
            if let Some(ws_url) = page["webSocketDebuggerUrl"].as_str() {
                return Ok(ws_url.to_string());
            }
        }
    }

    Err(BrowserError::LaunchFailed {
        context: format!("browser did not start within 5 seconds on port {port}"),
    })
}

/// CDP WebSocket handler loop: sends queued commands, routes responses by id,
/// and dispatches protocol events to registered handlers.
async fn cdp_handler_loop(
    ws: WsStream,
    mut cmd_rx: mpsc::Receiver<CdpCommand>,
    shared: Arc<CdpShared>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut pending: HashMap<u64, PendingTx> = HashMap::new();
    let next_id = AtomicU64::new(1);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let id = next_id.fetch_add(1, Ordering::Relaxed);
                let msg = json!({
                    "id": id,
                    "method": cmd.method,
                    "params": cmd.params,
                });
                let _ = pending.insert(id, cmd.response_tx);
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(val): Result<Value, _> = serde_json::from_str(&text) else {
                    continue;
                };
                if let Some(id) = val.get("id").and_then(Value::as_u64) {
                    if let Some(tx) = pending.remove(&id) {
                        if let Some(err) = val.get("error") {
                            let msg = err["message"].as_str().unwrap_or("CDP error");
                            let _ = tx.send(Err(msg.into()));
                        } else {
                            let _ = tx.send(Ok(val["result"].clone()));
                        }
                    }
                } else if let Some(method) = val.get("method").and_then(Value::as_str) {
                    dispatch_event(&shared, method, &val["params"]);
                }
            }
        }
    }
    debug!("CDP handler loop ended");
}

/// Route one protocol event to the appropriate handlers.
fn dispatch_event(shared: &CdpShared, method: &str, params: &Value) {
    match method {
        "Runtime.bindingCalled" => {
            let name = params["name"].as_str().unwrap_or_default();
            let payload = params["payload"].as_str().unwrap_or_default().to_string();
            let handler = shared.bindings.read().get(name).cloned();
            if let Some(handler) = handler {
                handler(payload);
            } else {
                warn!(binding = name, "binding called with no registered handler");
            }
        }
        "Page.frameNavigated" => {
            let frame = &params["frame"];
            // Only top-level navigations; subframes carry a parentId.
            if frame.get("parentId").is_some() {
                return;
            }
            let Some(url) = frame["url"].as_str() else {
                return;
            };
            *shared.current_url.write() = Some(url.to_string());
            let handlers: Vec<NavigationHandler> =
                shared.nav_handlers.read().iter().cloned().collect();
            for handler in handlers {
                handler(url.to_string());
            }
        }
        _ => {}
    }
}

/// Map a `Network.getCookies` result into [`Cookie`] records.
fn parse_cdp_cookies(result: &Value) -> Vec<Cookie> {
    let Some(raw) = result["cookies"].as_array() else {
        return Vec::new();
    };
    raw.iter()
        .filter_map(|c| {
            Some(Cookie {
                name: c["name"].as_str()?.to_string(),
                value: c["value"].as_str().unwrap_or_default().to_string(),
                domain: c["domain"].as_str().unwrap_or_default().to_string(),
                path: c["path"].as_str().unwrap_or("/").to_string(),
                expires: c["expires"].as_f64().filter(|e| *e >= 0.0),
                http_only: c["httpOnly"].as_bool().unwrap_or(false),
                secure: c["secure"].as_bool().unwrap_or(false),
                same_site: c["sameSite"].as_str().map(String::from),
            })
        })
        .collect()
}
