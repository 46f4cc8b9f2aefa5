//! Persisted storage-state record types.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use visor_crypto::SealedEnvelope;

/// Lifecycle status of a stored record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Saved but not (yet) verified for any site.
    Pending,
    /// At least one site verified and the record is within TTL.
    Verified,
    /// The blob could not be decrypted or re-verified.
    Rejected,
}

impl RecordStatus {
    /// Database string for this status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
        }
    }

    /// Parse a database string; unknown values map to `Pending`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "verified" => Self::Verified,
            "rejected" => Self::Rejected,
            _ => Self::Pending,
        }
    }
}

/// Caller-supplied and host-computed record metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Sites this capture targets (drives verification scope).
    #[serde(default)]
    pub sites: Vec<String>,
    /// Workflow that produced the capture, if auto-saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Whether the record came from session-end auto-save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_saved: Option<bool>,
    /// Ciphertext size in bytes (host-computed on save).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    /// SHA-256 of the ciphertext (host-computed on save).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Any additional caller fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A persisted storage-state row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageStateRecord {
    /// Store-issued id, `st_<8 hex>`.
    pub record_id: String,
    /// Owning user.
    pub owner_id: String,
    /// Key pair id that wrapped the data key.
    pub kid: String,
    /// Base64 AES-GCM ciphertext.
    pub ciphertext: String,
    /// Base64 GCM nonce.
    pub nonce: String,
    /// Base64 wrapped data key.
    pub wrapped_key: String,
    /// Record metadata.
    pub metadata: RecordMetadata,
    /// Per-site verification results.
    pub verified: BTreeMap<String, bool>,
    /// Lifecycle status.
    pub status: RecordStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl StorageStateRecord {
    /// View the crypto fields as a [`SealedEnvelope`].
    #[must_use]
    pub fn envelope(&self) -> SealedEnvelope {
        SealedEnvelope {
            ciphertext: self.ciphertext.clone(),
            nonce: self.nonce.clone(),
            wrapped_key: self.wrapped_key.clone(),
            kid: self.kid.clone(),
        }
    }

    /// Whether the record is younger than `ttl_hours` at `now`.
    #[must_use]
    pub fn is_fresh(&self, ttl_hours: i64, now: DateTime<Utc>) -> bool {
        now - self.created_at <= Duration::hours(ttl_hours)
    }
}
