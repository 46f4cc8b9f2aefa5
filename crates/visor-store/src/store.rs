//! The storage-state store: save, look up, replace, decrypt.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;
use visor_crypto::{EnvelopeCrypto, SealedEnvelope};

use crate::blob::{normalize_cookies, StorageStateBlob};
use crate::connection::ConnectionPool;
use crate::errors::StoreError;
use crate::migrations::run_migrations;
use crate::records::{RecordMetadata, RecordStatus, StorageStateRecord};
use crate::verify::{any_verified, verify_cookies};

/// Encrypted storage-state persistence over `SQLite`.
pub struct StorageStateStore {
    pool: ConnectionPool,
    crypto: Arc<EnvelopeCrypto>,
}

impl StorageStateStore {
    /// Wrap a pool and crypto handle, applying pending schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when a connection cannot be acquired or a
    /// migration fails.
    pub fn new(pool: ConnectionPool, crypto: Arc<EnvelopeCrypto>) -> Result<Self, StoreError> {
        let conn = pool.get()?;
        let _ = run_migrations(&conn)?;
        drop(conn);
        Ok(Self { pool, crypto })
    }

    /// Borrow the crypto handle.
    #[must_use]
    pub fn crypto(&self) -> &Arc<EnvelopeCrypto> {
        &self.crypto
    }

    /// Encrypt and persist a blob, running auto-verification.
    ///
    /// Expired cookies are filtered before encryption; the returned record
    /// carries the computed `verified` map and status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] when sealing fails and database errors
    /// otherwise.
    pub fn save(
        &self,
        owner_id: &str,
        mut blob: StorageStateBlob,
        mut metadata: RecordMetadata,
    ) -> Result<StorageStateRecord, StoreError> {
        let now = Utc::now();
        let now_secs = now.timestamp() as f64;

        let removed = blob.filter_expired(now_secs);
        if removed > 0 {
            info!(owner_id, removed, "filtered expired cookies before save");
        }

        let verified = verify_cookies(&blob.cookies, &metadata.sites, now_secs);
        let status = if any_verified(&verified) {
            RecordStatus::Verified
        } else {
            RecordStatus::Pending
        };

        let envelope = self.crypto.seal(&blob)?;
        let ciphertext_bytes = B64
            .decode(&envelope.ciphertext)
            .unwrap_or_default();
        metadata.size_bytes = Some(ciphertext_bytes.len() as u64);
        metadata.sha256 = Some(hex_digest(&ciphertext_bytes));

        let record = StorageStateRecord {
            record_id: new_record_id(),
            owner_id: owner_id.to_string(),
            kid: envelope.kid.clone(),
            ciphertext: envelope.ciphertext,
            nonce: envelope.nonce,
            wrapped_key: envelope.wrapped_key,
            metadata,
            verified,
            status,
            created_at: now,
            updated_at: now,
        };
        self.insert(&record)?;
        info!(
            owner_id,
            record_id = %record.record_id,
            status = record.status.as_str(),
            "saved storage state"
        );
        Ok(record)
    }

    /// Most recent verified record for `owner_id`, filtered by requested
    /// sites and freshness.
    ///
    /// Every requested site must be `true` in the record's verification map.
    ///
    /// # Errors
    ///
    /// Returns database errors; an absent record is `Ok(None)`.
    pub fn latest_verified(
        &self,
        owner_id: &str,
        sites: &[String],
        ttl_hours: i64,
    ) -> Result<Option<StorageStateRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, kid, ciphertext, nonce, wrapped_key,
                    metadata, verified, status, created_at, updated_at
             FROM storage_state_records
             WHERE owner_id = ?1 AND status = 'verified'
             ORDER BY created_at DESC
             LIMIT 50",
        )?;
        let rows = stmt.query_map(params![owner_id], row_to_record)?;

        let now = Utc::now();
        for row in rows {
            let record = row??;
            if !record.is_fresh(ttl_hours, now) {
                continue;
            }
            if sites
                .iter()
                .all(|s| record.verified.get(s).copied().unwrap_or(false))
            {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Fetch a record by id, scoped to its owner.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] when absent or owned by
    /// someone else.
    pub fn get(&self, owner_id: &str, record_id: &str) -> Result<StorageStateRecord, StoreError> {
        let conn = self.pool.get()?;
        let record = conn
            .query_row(
                "SELECT id, owner_id, kid, ciphertext, nonce, wrapped_key,
                        metadata, verified, status, created_at, updated_at
                 FROM storage_state_records WHERE id = ?1",
                params![record_id],
                row_to_record,
            )
            .map_err(|_| StoreError::RecordNotFound(record_id.to_string()))??;
        if record.owner_id != owner_id {
            return Err(StoreError::RecordNotFound(record_id.to_string()));
        }
        Ok(record)
    }

    /// List records for an owner, newest first.
    ///
    /// # Errors
    ///
    /// Returns database errors.
    pub fn list(
        &self,
        owner_id: &str,
        status: Option<RecordStatus>,
        limit: usize,
    ) -> Result<Vec<StorageStateRecord>, StoreError> {
        let limit = limit.clamp(1, 100);
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, owner_id, kid, ciphertext, nonce, wrapped_key,
                    metadata, verified, status, created_at, updated_at
             FROM storage_state_records
             WHERE owner_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![owner_id, limit as i64], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            let record = row??;
            if status.map_or(true, |s| record.status == s) {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Replace a record's envelope and metadata, re-running verification.
    ///
    /// The caller must own the record. A new envelope that fails to decrypt
    /// marks the record `rejected` and surfaces the crypto error.
    ///
    /// # Errors
    ///
    /// [`StoreError::RecordNotFound`] for unknown/foreign records,
    /// [`StoreError::Crypto`] for undecryptable envelopes.
    pub fn replace(
        &self,
        owner_id: &str,
        record_id: &str,
        envelope: SealedEnvelope,
        metadata: RecordMetadata,
    ) -> Result<StorageStateRecord, StoreError> {
        let mut record = self.get(owner_id, record_id)?;
        let now = Utc::now();

        // Replacement blobs arrive from extension captures, so cookies are
        // normalized (alias fields, sameSite casing, dedup) before
        // verification rather than parsed strictly.
        let raw: serde_json::Value = match self.crypto.open(&envelope) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(record_id, error = %err, "replacement envelope rejected");
                record.status = RecordStatus::Rejected;
                record.updated_at = now;
                self.update(&record)?;
                return Err(err.into());
            }
        };
        let raw_cookies = raw
            .get("cookies")
            .and_then(|c| c.as_array())
            .map_or(&[][..], |v| v.as_slice());
        let cookies = normalize_cookies(raw_cookies);

        let verified = verify_cookies(&cookies, &metadata.sites, now.timestamp() as f64);
        record.status = if any_verified(&verified) {
            RecordStatus::Verified
        } else {
            RecordStatus::Pending
        };
        record.kid = envelope.kid;
        record.ciphertext = envelope.ciphertext;
        record.nonce = envelope.nonce;
        record.wrapped_key = envelope.wrapped_key;
        record.metadata = metadata;
        record.verified = verified;
        record.updated_at = now;
        self.update(&record)?;
        info!(record_id, status = record.status.as_str(), "replaced storage state");
        Ok(record)
    }

    /// Decrypt a record back into its plaintext blob.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Crypto`] when the envelope cannot be opened.
    pub fn load_plaintext(
        &self,
        record: &StorageStateRecord,
    ) -> Result<StorageStateBlob, StoreError> {
        Ok(self.crypto.open(&record.envelope())?)
    }

    fn insert(&self, record: &StorageStateRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "INSERT INTO storage_state_records
                 (id, owner_id, kid, ciphertext, nonce, wrapped_key,
                  metadata, verified, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.record_id,
                record.owner_id,
                record.kid,
                record.ciphertext,
                record.nonce,
                record.wrapped_key,
                serde_json::to_string(&record.metadata)?,
                serde_json::to_string(&record.verified)?,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn update(&self, record: &StorageStateRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        let _ = conn.execute(
            "UPDATE storage_state_records
             SET kid = ?2, ciphertext = ?3, nonce = ?4, wrapped_key = ?5,
                 metadata = ?6, verified = ?7, status = ?8, updated_at = ?9
             WHERE id = ?1",
            params![
                record.record_id,
                record.kid,
                record.ciphertext,
                record.nonce,
                record.wrapped_key,
                serde_json::to_string(&record.metadata)?,
                serde_json::to_string(&record.verified)?,
                record.status.as_str(),
                record.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

fn new_record_id() -> String {
    format!("st_{}", &Uuid::new_v4().simple().to_string()[..8])
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<Result<StorageStateRecord, StoreError>> {
    let metadata_json: String = row.get(6)?;
    let verified_json: String = row.get(7)?;
    let status_str: String = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;

    Ok((|| {
        let metadata: RecordMetadata = serde_json::from_str(&metadata_json)?;
        let verified: BTreeMap<String, bool> = serde_json::from_str(&verified_json)?;
        Ok(StorageStateRecord {
            record_id: row.get(0)?,
            owner_id: row.get(1)?,
            kid: row.get(2)?,
            ciphertext: row.get(3)?,
            nonce: row.get(4)?,
            wrapped_key: row.get(5)?,
            metadata,
            verified,
            status: RecordStatus::parse(&status_str),
            created_at: parse_timestamp(&created_at),
            updated_at: parse_timestamp(&updated_at),
        })
    })())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::new(), |mut acc, b| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
