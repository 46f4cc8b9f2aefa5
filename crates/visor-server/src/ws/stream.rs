//! Stream channel — delivers sequenced wire events to a viewer and accepts
//! `ping` / `client_ready` / `sequence_reset_request` control messages.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, instrument, warn};

use visor_core::{ControlFrame, SessionId, WireErrorKind};
use visor_stream::QueuedFrame;

use crate::server::AppState;

/// Close code for malformed session ids.
pub const CLOSE_INVALID_SESSION: u16 = 4400;

/// GET /workflows/visual/{session_id}/stream — WebSocket upgrade.
pub async fn upgrade(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.server_config.max_message_size)
        .on_upgrade(move |socket| run_stream_session(socket, session_id, state))
}

#[instrument(skip_all, fields(session_id = %raw_session_id))]
async fn run_stream_session(mut socket: WebSocket, raw_session_id: String, state: AppState) {
    let session_id = match SessionId::parse(&raw_session_id) {
        Ok(id) => id,
        Err(_) => {
            warn!("rejecting stream connection with malformed session id");
            let _ = send_error(
                &mut socket,
                WireErrorKind::InvalidMessage,
                format!("invalid session id format: {raw_session_id}"),
            )
            .await;
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_INVALID_SESSION,
                    reason: "invalid_message".into(),
                })))
                .await;
            return;
        }
    };

    // Viewers may connect before the session starts producing; the streamer
    // is created on demand and resolved by every later task.
    let streamer = state.registry.register(&session_id);
    let client_id = uuid::Uuid::new_v4().to_string();
    let client = streamer.register_client(client_id.clone());
    info!(client_id, "stream client connected");

    let established = ControlFrame::ConnectionEstablished {
        session_id: session_id.clone(),
        timestamp: now_secs(),
    };
    if let Ok(json) = serde_json::to_string(&established) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound forwarder: client queue → socket.
    let writer_client = Arc::clone(&client);
    let writer = tokio::spawn(async move {
        while let Some(frame) = writer_client.next().await {
            let text = frame.payload.as_ref().clone();
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Inbound control messages.
    while let Some(Ok(msg)) = ws_rx.next().await {
        let text = match msg {
            Message::Text(ref t) => t.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            push_error(&client, "message is not valid JSON");
            continue;
        };
        match value.get("type").and_then(|v| v.as_str()) {
            Some("ping") => {
                if let Some(frame) = QueuedFrame::control(&ControlFrame::Pong {
                    timestamp: now_secs(),
                }) {
                    client.push_burst(vec![frame]);
                }
            }
            Some("client_ready") => {
                debug!(client_id, "client ready, serving snapshot-anchored replay");
                streamer.client_ready(&client_id);
            }
            Some("sequence_reset_request") => {
                debug!(client_id, "sequence reset requested");
                streamer.sequence_reset_request(&client_id);
            }
            other => {
                warn!(client_id, message_type = ?other, "unknown stream message");
                push_error(&client, "unknown message type");
            }
        }
    }

    info!(client_id, "stream client disconnected");
    streamer.remove_client(&client_id);
    writer.abort();
}

fn push_error(client: &visor_stream::ClientConnection, detail: &str) {
    if let Some(frame) = QueuedFrame::control(&ControlFrame::Error {
        error_type: WireErrorKind::InvalidMessage,
        error: detail.to_string(),
        timestamp: now_secs(),
    }) {
        client.push_burst(vec![frame]);
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

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
