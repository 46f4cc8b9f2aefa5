//! Wire types for the event stream.
//!
//! A [`RecorderEvent`] is an opaque JSON object produced by the in-page
//! recorder; the host reads only `type` and `timestamp` and passes everything
//! else through verbatim. A [`WireEvent`] is the host-assigned envelope put
//! on the stream channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireErrorKind;
use crate::ids::SessionId;

/// Recorder event type denoting a full DOM snapshot.
pub const FULL_SNAPSHOT_TYPE: i64 = 2;

/// An opaque recorder event.
///
/// Stored as raw JSON so fields the host does not model survive a round trip
/// unchanged. A recorder library upgrade must not alter host behavior.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecorderEvent(Value);

impl RecorderEvent {
    /// Wrap a parsed JSON object.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    /// Parse a raw payload string as emitted by the page-side bridge.
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error when the payload is not a
    /// JSON object.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(raw)?;
        Ok(Self(value))
    }

    /// The recorder event type, if present and numeric.
    #[must_use]
    pub fn event_type(&self) -> Option<i64> {
        self.0.get("type").and_then(Value::as_i64)
    }

    /// The recorder timestamp in milliseconds, if present.
    #[must_use]
    pub fn timestamp_ms(&self) -> Option<i64> {
        self.0.get("timestamp").and_then(Value::as_i64)
    }

    /// Whether this event is a FullSnapshot (`type == 2`).
    #[must_use]
    pub fn is_full_snapshot(&self) -> bool {
        self.event_type() == Some(FULL_SNAPSHOT_TYPE)
    }

    /// Fill in a host-side timestamp when the recorder omitted one.
    pub fn ensure_timestamp(&mut self, now_ms: i64) {
        if self.timestamp_ms().is_none() {
            if let Some(obj) = self.0.as_object_mut() {
                let _ = obj.insert("timestamp".into(), Value::from(now_ms));
            }
        }
    }

    /// Borrow the raw JSON value.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

/// Optional host-assigned metadata attached to a [`WireEvent`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMetadata {
    /// URL of the page origin that produced the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_url: Option<String>,
    /// Whether the wrapped event is a FullSnapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_snapshot: Option<bool>,
}

impl WireMetadata {
    /// True when no field is set (the `metadata` key is then omitted).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.origin_url.is_none() && self.is_snapshot.is_none()
    }
}

/// Envelope placed on the stream channel.
///
/// The recorder payload key is `event` (never `event_data`), and
/// `sequence_id` starts at 0 and increments by one per enqueued event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    /// Session this event belongs to.
    pub session_id: SessionId,
    /// Host-assigned enqueue time, seconds since the Unix epoch.
    pub timestamp: f64,
    /// The opaque recorder event.
    pub event: RecorderEvent,
    /// Strictly monotone per-session sequence number, starting at 0.
    pub sequence_id: u64,
    /// Optional host metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<WireMetadata>,
}

/// Control frames exchanged on the stream and control channels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Sent by the server immediately after a channel is accepted.
    ConnectionEstablished {
        /// Session the channel is bound to.
        session_id: SessionId,
        /// Server wall-clock time, seconds since epoch.
        timestamp: f64,
    },
    /// Replay restarts from `base`; subsequent `sequence_id`s are >= `base`.
    SequenceReset {
        /// First sequence id of the resumed stream.
        base: u64,
    },
    /// The channel or session reached its deadline and is closing.
    SessionExpired,
    /// Reply to a client `ping`.
    Pong {
        /// Server wall-clock time, seconds since epoch.
        timestamp: f64,
    },
    /// A control command executed successfully.
    Ack {
        /// Server wall-clock time, seconds since epoch.
        timestamp: f64,
    },
    /// A request failed; the channel stays open.
    Error {
        /// Machine-readable error kind.
        error_type: WireErrorKind,
        /// Human-readable detail.
        error: String,
        /// Server wall-clock time, seconds since epoch.
        timestamp: f64,
    },
}
