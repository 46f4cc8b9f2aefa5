//! `SQLite` connection pool with WAL mode enabled.
//!
//! Uses `r2d2` pooling with the `r2d2_sqlite` backend; a customizer runs on
//! each new connection to set WAL, busy timeout, and synchronous pragmas.

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::errors::StoreError;

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

/// Alias for a pooled connection.
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Configuration for the connection pool.
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// Maximum pool size (default: 8).
    pub pool_size: u32,
    /// Busy timeout in milliseconds (default: 30000).
    pub busy_timeout_ms: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))?;
        Ok(())
    }
}

/// Create an in-memory connection pool (tests, ephemeral deployments).
///
/// # Errors
///
/// Returns [`StoreError::Pool`] when the pool cannot be built.
pub fn new_in_memory(config: &ConnectionConfig) -> Result<ConnectionPool, StoreError> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_DB: AtomicU64 = AtomicU64::new(0);

    // A named shared-cache database keeps one store visible to every pooled
    // connection; a plain :memory: pool would give each connection its own
    // empty database. The name is unique per pool so independent stores do
    // not alias.
    let name = NEXT_DB.fetch_add(1, Ordering::Relaxed);
    let uri = format!("file:visor_mem_{name}?mode=memory&cache=shared");
    let manager = SqliteConnectionManager::file(uri).with_flags(
        rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
            | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
            | rusqlite::OpenFlags::SQLITE_OPEN_URI,
    );
    build_pool(manager, config)
}

/// Create a file-backed connection pool.
///
/// # Errors
///
/// Returns [`StoreError::Pool`] when the pool cannot be built.
pub fn new_file(path: &str, config: &ConnectionConfig) -> Result<ConnectionPool, StoreError> {
    build_pool(SqliteConnectionManager::file(path), config)
}

fn build_pool(
    manager: SqliteConnectionManager,
    config: &ConnectionConfig,
) -> Result<ConnectionPool, StoreError> {
    let pool = Pool::builder()
        .max_size(config.pool_size)
        .connection_timeout(std::time::Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_pool_connects() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn in_memory_pool_shares_schema_across_connections() {
        let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
        {
            let conn = pool.get().unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        }
        let conn2 = pool.get().unwrap();
        conn2.execute("INSERT INTO t (x) VALUES (7)", []).unwrap();
        let x: i64 = conn2.query_row("SELECT x FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(x, 7);
    }

    #[test]
    fn distinct_in_memory_pools_do_not_alias() {
        let first = new_in_memory(&ConnectionConfig::default()).unwrap();
        let second = new_in_memory(&ConnectionConfig::default()).unwrap();
        first
            .get()
            .unwrap()
            .execute_batch("CREATE TABLE only_in_first (x INTEGER)")
            .unwrap();
        let err = second
            .get()
            .unwrap()
            .execute("INSERT INTO only_in_first (x) VALUES (1)", []);
        assert!(err.is_err());
    }

    #[test]
    fn file_pool_connects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let pool = new_file(path.to_str().unwrap(), &ConnectionConfig::default()).unwrap();
        let conn = pool.get().unwrap();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }
}
