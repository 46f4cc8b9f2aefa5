//! Session identifier newtype.
//!
//! A [`SessionId`] is a `String` in the canonical form `visual-<uuid-v4>`.
//! Lookups accept a bare UUID and normalize it by prefixing `visual-`;
//! anything else is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Canonical prefix for visual streaming session ids.
pub const SESSION_ID_PREFIX: &str = "visual-";

/// Error returned when a session id cannot be parsed or normalized.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionIdError {
    /// The supplied string is neither `visual-<uuid>` nor a bare UUID.
    #[error("invalid session id format: {0}")]
    InvalidFormat(String),
}

/// Identifier for a running visual-streaming session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session id in canonical form.
    #[must_use]
    pub fn new() -> Self {
        Self(format!("{SESSION_ID_PREFIX}{}", Uuid::new_v4()))
    }

    /// Parse a supplied id, normalizing a bare UUID to `visual-<uuid>`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionIdError::InvalidFormat`] when the input is neither a
    /// canonical id nor a parseable UUID.
    pub fn parse(input: &str) -> Result<Self, SessionIdError> {
        if let Some(uuid_part) = input.strip_prefix(SESSION_ID_PREFIX) {
            if Uuid::parse_str(uuid_part).is_ok() {
                return Ok(Self(input.to_string()));
            }
            return Err(SessionIdError::InvalidFormat(input.to_string()));
        }
        if Uuid::parse_str(input).is_ok() {
            return Ok(Self(format!("{SESSION_ID_PREFIX}{input}")));
        }
        Err(SessionIdError::InvalidFormat(input.to_string()))
    }

    /// Return the inner string as a slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume self and return the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
