//! Encrypted browser storage-state persistence.
//!
//! A storage state is the pair (cookies, per-origin local storage) needed to
//! resume an authenticated browser session. Blobs are envelope-encrypted via
//! `visor-crypto` and persisted in `SQLite`; records carry an auto-computed
//! per-site verification map and a freshness TTL.

pub mod blob;
pub mod connection;
pub mod errors;
pub mod loader;
pub mod migrations;
pub mod records;
pub mod store;
pub mod verify;

pub use blob::{normalize_cookies, Cookie, LocalStorageItem, OriginState, StorageStateBlob};
pub use connection::{new_file, new_in_memory, ConnectionConfig, ConnectionPool};
pub use errors::StoreError;
pub use loader::{LoadedState, PriorityLoader, StateSource};
pub use records::{RecordMetadata, RecordStatus, StorageStateRecord};
pub use store::StorageStateStore;
