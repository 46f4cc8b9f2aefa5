//! Wire-observable error kinds.
//!
//! These are kinds, not types: every user-facing channel maps internal
//! failures onto this closed set. Unmodeled errors surface as
//! `execution_failed` after being logged with a stable code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds observable on the stream and control channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// Malformed or unknown message shape.
    InvalidMessage,
    /// Unknown or expired session id.
    SessionNotFound,
    /// Session exists but no usable browser handle yet.
    BrowserNotReady,
    /// Browser command raised or timed out.
    ExecutionFailed,
    /// Too many messages per second.
    RateLimitExceeded,
    /// Channel closed after its deadline.
    SessionExpired,
}

impl WireErrorKind {
    /// The wire string for this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::SessionNotFound => "session_not_found",
            Self::BrowserNotReady => "browser_not_ready",
            Self::ExecutionFailed => "execution_failed",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::SessionExpired => "session_expired",
        }
    }
}

impl fmt::Display for WireErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_snake_case() {
        let json = serde_json::to_string(&WireErrorKind::RateLimitExceeded).unwrap();
        assert_eq!(json, "\"rate_limit_exceeded\"");
    }

    #[test]
    fn display_matches_wire_string() {
        assert_eq!(WireErrorKind::InvalidMessage.to_string(), "invalid_message");
        assert_eq!(WireErrorKind::SessionExpired.to_string(), "session_expired");
    }

    #[test]
    fn roundtrip() {
        for kind in [
            WireErrorKind::InvalidMessage,
            WireErrorKind::SessionNotFound,
            WireErrorKind::BrowserNotReady,
            WireErrorKind::ExecutionFailed,
            WireErrorKind::RateLimitExceeded,
            WireErrorKind::SessionExpired,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            let back: WireErrorKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }
}
