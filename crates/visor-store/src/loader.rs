//! Priority loader for storage state.
//!
//! Tried in order before each workflow run:
//! 1. database (`latest_verified`)
//! 2. per-user plaintext file
//! 3. environment-provided blob (`STORAGE_STATE_JSON_B64`)
//! 4. shared root file (`storage_state.json`)
//!
//! Any retrieval error logs a warning and falls through; the workflow then
//! proceeds unauthenticated.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::Serialize;
use tracing::{info, warn};

use crate::blob::StorageStateBlob;
use crate::store::StorageStateStore;

/// Which source produced a loaded state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    /// Encrypted database record.
    Database,
    /// Per-user plaintext file.
    UserFile,
    /// `STORAGE_STATE_JSON_B64` environment variable (shared across users).
    Environment,
    /// Repository-root `storage_state.json` (shared across users).
    RootFile,
}

/// A loaded storage state and its provenance.
#[derive(Debug)]
pub struct LoadedState {
    /// The decrypted (or plaintext) blob.
    pub blob: StorageStateBlob,
    /// Where it came from.
    pub source: StateSource,
    /// Database record id, when loaded from the store.
    pub record_id: Option<String>,
}

/// Loads storage state with source precedence.
pub struct PriorityLoader {
    store: Option<Arc<StorageStateStore>>,
    profile_dir: PathBuf,
    root_file: PathBuf,
}

impl PriorityLoader {
    /// Build a loader. `profile_dir` holds per-user `{user}/storage_state.json`
    /// files; `root_file` is the shared dev fallback.
    #[must_use]
    pub fn new(
        store: Option<Arc<StorageStateStore>>,
        profile_dir: PathBuf,
        root_file: PathBuf,
    ) -> Self {
        Self {
            store,
            profile_dir,
            root_file,
        }
    }

    /// Try each source in order, returning the first hit.
    #[must_use]
    pub fn load(&self, owner_id: &str, sites: &[String], ttl_hours: i64) -> Option<LoadedState> {
        if let Some(state) = self.from_database(owner_id, sites, ttl_hours) {
            info!(owner_id, source = "database", "loaded storage state");
            return Some(state);
        }
        if let Some(state) = self.from_user_file(owner_id) {
            info!(owner_id, source = "user_file", "loaded storage state");
            return Some(state);
        }
        if let Some(state) = self.from_environment() {
            info!(source = "environment", "loaded storage state (shared across users)");
            return Some(state);
        }
        if let Some(state) = self.from_root_file() {
            info!(source = "root_file", "loaded storage state (shared across users)");
            return Some(state);
        }
        warn!(owner_id, "no storage state found, starting anonymous session");
        None
    }

    fn from_database(
        &self,
        owner_id: &str,
        sites: &[String],
        ttl_hours: i64,
    ) -> Option<LoadedState> {
        let store = self.store.as_ref()?;
        let record = match store.latest_verified(owner_id, sites, ttl_hours) {
            Ok(record) => record?,
            Err(err) => {
                warn!(owner_id, error = %err, "database storage-state lookup failed");
                return None;
            }
        };
        match store.load_plaintext(&record) {
            Ok(blob) => Some(LoadedState {
                blob,
                source: StateSource::Database,
                record_id: Some(record.record_id),
            }),
            Err(err) => {
                warn!(record_id = %record.record_id, error = %err, "storage-state decrypt failed");
                None
            }
        }
    }

    fn from_user_file(&self, owner_id: &str) -> Option<LoadedState> {
        let path = self.profile_dir.join(owner_id).join("storage_state.json");
        read_blob_file(&path).map(|blob| LoadedState {
            blob,
            source: StateSource::UserFile,
            record_id: None,
        })
    }

    fn from_environment(&self) -> Option<LoadedState> {
        let b64 = std::env::var("STORAGE_STATE_JSON_B64").ok()?;
        let bytes = match B64.decode(b64.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(error = %err, "STORAGE_STATE_JSON_B64 is not valid base64");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(blob) => Some(LoadedState {
                blob,
                source: StateSource::Environment,
                record_id: None,
            }),
            Err(err) => {
                warn!(error = %err, "STORAGE_STATE_JSON_B64 did not parse");
                None
            }
        }
    }

    fn from_root_file(&self) -> Option<LoadedState> {
        read_blob_file(&self.root_file).map(|blob| LoadedState {
            blob,
            source: StateSource::RootFile,
            record_id: None,
        })
    }
}

fn read_blob_file(path: &std::path::Path) -> Option<StorageStateBlob> {
    if !path.exists() {
        return None;
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "storage-state file unreadable");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(blob) => Some(blob),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "storage-state file did not parse");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::Cookie;

    fn blob_json() -> String {
        serde_json::to_string(&StorageStateBlob {
            cookies: vec![Cookie {
                name: "li_at".into(),
                value: "t".into(),
                domain: ".linkedin.com".into(),
                path: "/".into(),
                expires: None,
                http_only: true,
                secure: true,
                same_site: None,
            }],
            origins: vec![],
            env_metadata: None,
        })
        .unwrap()
    }

    #[test]
    fn user_file_beats_root_file() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(profiles.join("user_1")).unwrap();
        std::fs::write(profiles.join("user_1/storage_state.json"), blob_json()).unwrap();
        let root = dir.path().join("storage_state.json");
        std::fs::write(&root, blob_json()).unwrap();

        let loader = PriorityLoader::new(None, profiles, root);
        let loaded = loader.load("user_1", &[], 24).unwrap();
        assert_eq!(loaded.source, StateSource::UserFile);
    }

    #[test]
    fn falls_back_to_root_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("storage_state.json");
        std::fs::write(&root, blob_json()).unwrap();

        let loader = PriorityLoader::new(None, dir.path().join("profiles"), root);
        let loaded = loader.load("user_1", &[], 24).unwrap();
        assert_eq!(loaded.source, StateSource::RootFile);
        assert_eq!(loaded.blob.cookies.len(), 1);
    }

    #[test]
    fn missing_everything_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PriorityLoader::new(
            None,
            dir.path().join("profiles"),
            dir.path().join("storage_state.json"),
        );
        assert!(loader.load("user_1", &[], 24).is_none());
    }

    #[test]
    fn corrupt_user_file_falls_through() {
        let dir = tempfile::tempdir().unwrap();
        let profiles = dir.path().join("profiles");
        std::fs::create_dir_all(profiles.join("user_1")).unwrap();
        std::fs::write(profiles.join("user_1/storage_state.json"), "{not json").unwrap();
        let root = dir.path().join("storage_state.json");
        std::fs::write(&root, blob_json()).unwrap();

        let loader = PriorityLoader::new(None, profiles, root);
        let loaded = loader.load("user_1", &[], 24).unwrap();
        assert_eq!(loaded.source, StateSource::RootFile);
    }
}
