//! Schema migration runner for the storage-state database.
//!
//! Migrations run in version order, each inside its own transaction; the
//! `schema_version` table records applied versions so the runner is
//! idempotent.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StoreError;

struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "storage_state_records table and owner/status index",
    sql: "CREATE TABLE IF NOT EXISTS storage_state_records (
              id           TEXT PRIMARY KEY,
              owner_id     TEXT NOT NULL,
              kid          TEXT NOT NULL,
              ciphertext   TEXT NOT NULL,
              nonce        TEXT NOT NULL,
              wrapped_key  TEXT NOT NULL,
              metadata     TEXT NOT NULL DEFAULT '{}',
              verified     TEXT NOT NULL DEFAULT '{}',
              status       TEXT NOT NULL DEFAULT 'pending',
              created_at   TEXT NOT NULL,
              updated_at   TEXT NOT NULL
          );
          CREATE INDEX IF NOT EXISTS idx_records_owner_status
              ON storage_state_records (owner_id, status, created_at DESC);",
}];

/// Run all pending migrations on the given connection.
///
/// # Errors
///
/// Returns [`StoreError::Migration`] when any migration SQL fails; the
/// failing migration is rolled back.
pub fn run_migrations(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
             version INTEGER PRIMARY KEY,
             applied_at TEXT NOT NULL
         )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    let mut applied = 0;
    for migration in MIGRATIONS {
        if migration.version <= current {
            debug!(version = migration.version, "migration already applied");
            continue;
        }
        conn.execute_batch(&format!(
            "BEGIN;\n{}\nINSERT INTO schema_version (version, applied_at) VALUES ({}, datetime('now'));\nCOMMIT;",
            migration.sql, migration.version
        ))
        .map_err(|e| StoreError::Migration {
            message: format!("v{} ({}): {e}", migration.version, migration.description),
        })?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied migration"
        );
        applied += 1;
    }
    Ok(applied)
}
