//! Control channel — translates viewer mouse/keyboard/wheel messages into
//! browser input.
//!
//! Connections are rate-limited to a rolling per-second budget, capped at a
//! hard wall-clock lifetime, and each browser command runs under its own
//! short timeout. Keystrokes are never logged in cleartext; only the action
//! and key category (single character vs named key) are recorded.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use visor_browser::{BrowserError, BrowserSession, MouseButton};
use visor_core::{ControlFrame, SessionId, WireErrorKind};

use crate::server::AppState;

/// Close code for malformed session ids.
pub const CLOSE_INVALID_SESSION: u16 = 4400;
/// Close code for unknown sessions.
pub const CLOSE_SESSION_NOT_FOUND: u16 = 4404;
/// Close code for the hard connection deadline.
pub const CLOSE_SESSION_EXPIRED: u16 = 4408;
/// Close code when the session has no usable browser.
pub const CLOSE_BROWSER_NOT_READY: u16 = 4503;

/// Per-command execution budget against the browser.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for viewer-supplied coordinates.
const COORDINATE_MAX: f64 = 10_000.0;

/// GET /workflows/visual/{session_id}/control — WebSocket upgrade.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.server_config.max_message_size)
        .on_upgrade(move |socket| run_control_session(socket, session_id, state))
}

#[instrument(skip_all, fields(session_id = %raw_session_id))]
async fn run_control_session(mut socket: WebSocket, raw_session_id: String, state: AppState) {
    let session_id = match SessionId::parse(&raw_session_id) {
        Ok(id) => id,
        Err(_) => {
            let _ = send_error(
                &mut socket,
                WireErrorKind::InvalidMessage,
                format!("invalid session id format: {raw_session_id}"),
            )
            .await;
            close(&mut socket, CLOSE_INVALID_SESSION, "invalid_message").await;
            return;
        }
    };

    let Some(session) = state.manager.session(&session_id) else {
        let _ = send_error(
            &mut socket,
            WireErrorKind::SessionNotFound,
            format!("session {session_id} not found or expired"),
        )
        .await;
        close(&mut socket, CLOSE_SESSION_NOT_FOUND, "session_not_found").await;
        return;
    };
    let Some(browser) = session.browser() else {
        let _ = send_error(
            &mut socket,
            WireErrorKind::BrowserNotReady,
            "browser not available for session".into(),
        )
        .await;
        close(&mut socket, CLOSE_BROWSER_NOT_READY, "browser_not_ready").await;
        return;
    };

    // While a viewer holds the control channel, scripted input steps wait;
    // interactive password entry takes over from the workflow.
    // Raised before the handshake so it is in effect once the viewer sees
    // `connection_established`.
    let pause = session.pause_gate();
    pause.pause();

    let established = ControlFrame::ConnectionEstablished {
        session_id: session_id.clone(),
        timestamp: now_secs(),
    };
    if let Ok(json) = serde_json::to_string(&established) {
        let _ = socket.send(Message::Text(json.into())).await;
    }
    info!("control channel connected");

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.streaming.control_max_duration_secs);
    let mut limiter = RateLimiter::new(state.streaming.control_rate_per_sec);
    let mut message_count: u64 = 0;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                info!(message_count, "control channel reached its deadline");
                if let Ok(json) = serde_json::to_string(&ControlFrame::SessionExpired) {
                    let _ = socket.send(Message::Text(json.into())).await;
                }
                close(&mut socket, CLOSE_SESSION_EXPIRED, "session_expired").await;
                break;
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(ref t) => t.to_string(),
                    Message::Close(_) => break,
                    _ => continue,
                };
                message_count += 1;

                let command = match parse_control_message(&text) {
                    Ok(command) => command,
                    Err(detail) => {
                        let _ = send_error(&mut socket, WireErrorKind::InvalidMessage, detail).await;
                        continue;
                    }
                };
                if !limiter.allow(Instant::now()) {
                    metrics::counter!("control_rate_limited_total").increment(1);
                    let _ = send_error(
                        &mut socket,
                        WireErrorKind::RateLimitExceeded,
                        "control message rate limit exceeded".into(),
                    )
                    .await;
                    continue;
                }

                metrics::counter!("control_messages_total").increment(1);
                match execute_command(browser.as_ref(), &command).await {
                    Ok(()) => {
                        let ack = ControlFrame::Ack { timestamp: now_secs() };
                        if let Ok(json) = serde_json::to_string(&ack) {
                            let _ = socket.send(Message::Text(json.into())).await;
                        }
                    }
                    Err(err) => {
                        warn!(command = command.log_label(), error = %err, "control command failed");
                        let _ = send_error(
                            &mut socket,
                            WireErrorKind::ExecutionFailed,
                            err.to_string(),
                        )
                        .await;
                    }
                }
            }
        }
    }

    pause.resume();
    info!(message_count, "control channel closed");
}

/// A validated control command.
#[derive(Clone, Debug, PartialEq)]
pub enum ControlCommand {
    /// Click at (x, y); `click_count >= 2` becomes a double-click.
    MouseClick {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
        /// Mouse button.
        button: MouseButton,
        /// Number of clicks.
        click_count: u32,
    },
    /// Move the pointer.
    MouseMove {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
    },
    /// Move then press.
    MouseDown {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
        /// Mouse button.
        button: MouseButton,
    },
    /// Release a button.
    MouseUp {
        /// Mouse button.
        button: MouseButton,
    },
    /// Double-click at (x, y).
    MouseDblClick {
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
    },
    /// Scroll.
    Wheel {
        /// Horizontal delta.
        delta_x: f64,
        /// Vertical delta.
        delta_y: f64,
        /// X coordinate.
        x: f64,
        /// Y coordinate.
        y: f64,
    },
    /// Key press or hold.
    KeyDown {
        /// Key value.
        key: String,
    },
    /// Key release.
    KeyUp {
        /// Key value.
        key: String,
    },
}

impl ControlCommand {
    /// Safe-to-log label: never contains key characters.
    #[must_use]
    pub fn log_label(&self) -> &'static str {
        match self {
            Self::MouseClick { .. } => "mouse.click",
            Self::MouseMove { .. } => "mouse.move",
            Self::MouseDown { .. } => "mouse.down",
            Self::MouseUp { .. } => "mouse.up",
            Self::MouseDblClick { .. } => "mouse.dblclick",
            Self::Wheel { .. } => "wheel",
            Self::KeyDown { key } => {
                if key.chars().count() == 1 {
                    "keyboard.char"
                } else {
                    "keyboard.named"
                }
            }
            Self::KeyUp { .. } => "keyboard.up",
        }
    }
}

/// Parse and validate one raw control-channel message.
///
/// # Errors
///
/// Returns a human-readable description for any malformed message; the
/// caller replies `invalid_message` without closing the channel.
pub fn parse_control_message(raw: &str) -> Result<ControlCommand, String> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| format!("message is not valid JSON: {e}"))?;
    let message = value
        .get("message")
        .and_then(Value::as_object)
        .ok_or("missing or invalid 'message' field")?;
    let message_type = message
        .get("type")
        .and_then(Value::as_str)
        .ok_or("missing 'type' field in message")?;

    match message_type {
        "mouse" => parse_mouse(message),
        "wheel" => parse_wheel(message),
        "keyboard" => parse_keyboard(message),
        other => Err(format!("unknown message type: {other}")),
    }
}

fn parse_mouse(message: &serde_json::Map<String, Value>) -> Result<ControlCommand, String> {
    let action = message
        .get("action")
        .and_then(Value::as_str)
        .ok_or("mouse message missing 'action'")?;
    let button = MouseButton::parse(
        message
            .get("button")
            .and_then(Value::as_str)
            .unwrap_or("left"),
    );
    let coord = |field: &str| -> Result<f64, String> {
        let v = message
            .get(field)
            .and_then(Value::as_f64)
            .ok_or(format!("mouse message missing required field: {field}"))?;
        if !(0.0..=COORDINATE_MAX).contains(&v) {
            return Err(format!("invalid coordinate {field}={v} (must be 0-10000)"));
        }
        Ok(v)
    };

    match action {
        "click" => {
            let click_count = message
                .get("clickCount")
                .and_then(Value::as_u64)
                .unwrap_or(1) as u32;
            Ok(ControlCommand::MouseClick {
                x: coord("x")?,
                y: coord("y")?,
                button,
                click_count,
            })
        }
        "move" => Ok(ControlCommand::MouseMove {
            x: coord("x")?,
            y: coord("y")?,
        }),
        "down" => Ok(ControlCommand::MouseDown {
            x: coord("x")?,
            y: coord("y")?,
            button,
        }),
        "up" => Ok(ControlCommand::MouseUp { button }),
        "dblclick" => Ok(ControlCommand::MouseDblClick {
            x: coord("x")?,
            y: coord("y")?,
        }),
        other => Err(format!("unknown mouse action: {other}")),
    }
}

fn parse_wheel(message: &serde_json::Map<String, Value>) -> Result<ControlCommand, String> {
    let num = |field: &str| message.get(field).and_then(Value::as_f64).unwrap_or(0.0);
    let coord = |field: &str| -> Result<f64, String> {
        let v = num(field);
        if !(0.0..=COORDINATE_MAX).contains(&v) {
            return Err(format!("invalid coordinate {field}={v} (must be 0-10000)"));
        }
        Ok(v)
    };
    Ok(ControlCommand::Wheel {
        delta_x: num("deltaX"),
        delta_y: num("deltaY"),
        x: coord("x")?,
        y: coord("y")?,
    })
}

fn parse_keyboard(message: &serde_json::Map<String, Value>) -> Result<ControlCommand, String> {
    let action = message
        .get("action")
        .and_then(Value::as_str)
        .ok_or("keyboard message missing 'action'")?;
    let key = message
        .get("key")
        .and_then(Value::as_str)
        .ok_or("keyboard message missing 'key'")?
        .to_string();
    match action {
        "down" => Ok(ControlCommand::KeyDown { key }),
        "up" => Ok(ControlCommand::KeyUp { key }),
        other => Err(format!("unknown keyboard action: {other}")),
    }
}

/// Execute a validated command against the browser under the per-command
/// timeout.
async fn execute_command(
    browser: &dyn BrowserSession,
    command: &ControlCommand,
) -> Result<(), BrowserError> {
    let fut = dispatch(browser, command);
    match tokio::time::timeout(COMMAND_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(BrowserError::Timeout {
            timeout_ms: COMMAND_TIMEOUT.as_millis() as u64,
            context: command.log_label().to_string(),
        }),
    }
}

async fn dispatch(
    browser: &dyn BrowserSession,
    command: &ControlCommand,
) -> Result<(), BrowserError> {
    match command {
        ControlCommand::MouseClick {
            x,
            y,
            button,
            click_count,
        } => {
            if *click_count >= 2 {
                browser.mouse_dblclick(*x, *y).await
            } else {
                debug!(x, y, "mouse click");
                browser.mouse_click(*x, *y, *button).await
            }
        }
        ControlCommand::MouseMove { x, y } => browser.mouse_move(*x, *y).await,
        ControlCommand::MouseDown { x, y, button } => {
            browser.mouse_move(*x, *y).await?;
            browser.mouse_down(*button).await
        }
        ControlCommand::MouseUp { button } => browser.mouse_up(*button).await,
        ControlCommand::MouseDblClick { x, y } => browser.mouse_dblclick(*x, *y).await,
        ControlCommand::Wheel {
            delta_x, delta_y, x, y,
        } => browser.mouse_wheel(*delta_x, *delta_y, *x, *y).await,
        ControlCommand::KeyDown { key } => {
            // Printable characters go through press (down + up in one).
            if key.chars().count() == 1 {
                debug!("keyboard: character input");
                browser.keyboard_press(key).await
            } else {
                debug!(key = %key, "keyboard: named key");
                browser.keyboard_down(key).await
            }
        }
        ControlCommand::KeyUp { key } => browser.keyboard_up(key).await,
    }
}

/// Rolling one-second message budget.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl RateLimiter {
    /// Allow up to `per_second` messages per rolling second.
    #[must_use]
    pub fn new(per_second: u32) -> Self {
        Self {
            limit: per_second as usize,
            window: Duration::from_secs(1),
            hits: VecDeque::new(),
        }
    }

    /// Record an attempt at `now`; `false` means over budget (drop it).
    pub fn allow(&mut self, now: Instant) -> bool {
        while let Some(front) = self.hits.front() {
            if now.duration_since(*front) > self.window {
                let _ = self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

async fn send_error(
    socket: &mut WebSocket,
    kind: WireErrorKind,
    detail: String,
) -> Result<(), axum::Error> {
    let frame = ControlFrame::Error {
        error_type: kind,
        error: detail,
        timestamp: now_secs(),
    };
    match serde_json::to_string(&frame) {
        Ok(json) => socket.send(Message::Text(json.into())).await,
        Err(_) => Ok(()),
    }
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(message: Value) -> String {
        serde_json::json!({ "session_id": "visual-x", "message": message }).to_string()
    }

    #[test]
    fn parses_mouse_click() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "click", "x": 10.0, "y": 20.0,
            "button": "left", "clickCount": 1
        }));
        let cmd = parse_control_message(&raw).unwrap();
        assert_eq!(
            cmd,
            ControlCommand::MouseClick {
                x: 10.0,
                y: 20.0,
                button: MouseButton::Left,
                click_count: 1
            }
        );
    }

    #[test]
    fn click_count_two_is_dblclick_intent() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "click", "x": 1.0, "y": 2.0, "clickCount": 2
        }));
        match parse_control_message(&raw).unwrap() {
            ControlCommand::MouseClick { click_count, .. } => assert_eq!(click_count, 2),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn negative_coordinate_rejected() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "click", "x": -1.0, "y": 5.0
        }));
        let err = parse_control_message(&raw).unwrap_err();
        assert!(err.contains("0-10000"));
    }

    #[test]
    fn oversized_coordinate_rejected() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "move", "x": 10001.0, "y": 5.0
        }));
        assert!(parse_control_message(&raw).is_err());
    }

    #[test]
    fn mouse_up_needs_no_coordinates() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "up", "button": "right"
        }));
        assert_eq!(
            parse_control_message(&raw).unwrap(),
            ControlCommand::MouseUp {
                button: MouseButton::Right
            }
        );
    }

    #[test]
    fn mouse_down_requires_coordinates() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "down", "button": "left"
        }));
        assert!(parse_control_message(&raw).is_err());
    }

    #[test]
    fn parses_wheel_with_defaults() {
        let raw = wrap(serde_json::json!({
            "type": "wheel", "deltaY": 120.0, "x": 50.0, "y": 60.0
        }));
        assert_eq!(
            parse_control_message(&raw).unwrap(),
            ControlCommand::Wheel {
                delta_x: 0.0,
                delta_y: 120.0,
                x: 50.0,
                y: 60.0
            }
        );
    }

    #[test]
    fn parses_keyboard_down_and_up() {
        let down = wrap(serde_json::json!({
            "type": "keyboard", "action": "down", "key": "Enter", "code": "Enter"
        }));
        assert_eq!(
            parse_control_message(&down).unwrap(),
            ControlCommand::KeyDown {
                key: "Enter".into()
            }
        );
        let up = wrap(serde_json::json!({
            "type": "keyboard", "action": "up", "key": "a"
        }));
        assert_eq!(
            parse_control_message(&up).unwrap(),
            ControlCommand::KeyUp { key: "a".into() }
        );
    }

    #[test]
    fn missing_message_field_rejected() {
        let raw = serde_json::json!({ "session_id": "visual-x" }).to_string();
        assert!(parse_control_message(&raw).unwrap_err().contains("message"));
    }

    #[test]
    fn missing_type_rejected() {
        let raw = wrap(serde_json::json!({ "action": "click" }));
        assert!(parse_control_message(&raw).unwrap_err().contains("type"));
    }

    #[test]
    fn unknown_type_rejected() {
        let raw = wrap(serde_json::json!({ "type": "gamepad" }));
        assert!(parse_control_message(&raw)
            .unwrap_err()
            .contains("unknown message type"));
    }

    #[test]
    fn unknown_mouse_action_rejected() {
        let raw = wrap(serde_json::json!({
            "type": "mouse", "action": "teleport", "x": 1.0, "y": 1.0
        }));
        assert!(parse_control_message(&raw)
            .unwrap_err()
            .contains("unknown mouse action"));
    }

    #[test]
    fn log_labels_never_contain_key_text() {
        let char_key = ControlCommand::KeyDown { key: "p".into() };
        assert_eq!(char_key.log_label(), "keyboard.char");
        let named = ControlCommand::KeyDown {
            key: "Backspace".into(),
        };
        assert_eq!(named.log_label(), "keyboard.named");
        assert!(!char_key.log_label().contains('p'));
    }

    #[test]
    fn rate_limiter_allows_up_to_limit() {
        let mut limiter = RateLimiter::new(100);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow(now));
        }
        // The 101st message within the same second is rejected.
        assert!(!limiter.allow(now));
    }

    #[test]
    fn rate_limiter_window_rolls() {
        let mut limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.allow(start));
        assert!(limiter.allow(start));
        assert!(!limiter.allow(start + Duration::from_millis(500)));
        // After the window passes, budget frees up.
        assert!(limiter.allow(start + Duration::from_millis(1501)));
    }
}
