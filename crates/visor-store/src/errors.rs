//! Error type for storage-state persistence.

use thiserror::Error;
use visor_crypto::CryptoError;

/// Errors from storage-state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `SQLite` database error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Connection pool error.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// JSON serialization/deserialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Envelope crypto failure.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Schema migration failed.
    #[error("migration error: {message}")]
    Migration {
        /// Which migration failed and why.
        message: String,
    },

    /// No record with that id visible to the caller.
    ///
    /// Ownership mismatches deliberately collapse into this variant so a
    /// caller cannot probe for other owners' record ids.
    #[error("record not found: {0}")]
    RecordNotFound(String),
}
