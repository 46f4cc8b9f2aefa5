//! Shared fixtures for server tests.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};

use visor_browser::{BrowserError, BrowserSession};
use visor_core::StreamingConfig;
use visor_crypto::{EnvelopeCrypto, KeyMaterial};
use visor_runtime::{BrowserLauncher, SessionManager};
use visor_store::{
    new_in_memory, ConnectionConfig, Cookie, PriorityLoader, RecordMetadata, StorageStateBlob,
    StorageStateRecord, StorageStateStore,
};
use visor_stream::StreamerRegistry;

use crate::config::ServerConfig;
use crate::server::VisorServer;

fn test_pems() -> &'static (String, String) {
    static PEMS: OnceLock<(String, String)> = OnceLock::new();
    PEMS.get_or_init(|| {
        let mut rng = rand::thread_rng();
        let sk = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pk = RsaPublicKey::from(&sk);
        (
            sk.to_pkcs8_pem(LineEnding::LF).unwrap().to_string(),
            pk.to_public_key_pem(LineEnding::LF).unwrap(),
        )
    })
}

pub(crate) fn test_store() -> Arc<StorageStateStore> {
    let (sk_pem, pk_pem) = test_pems();
    let crypto = Arc::new(EnvelopeCrypto::new(
        KeyMaterial::from_pems("rsa-test", Some(pk_pem), Some(sk_pem)).unwrap(),
    ));
    let pool = new_in_memory(&ConnectionConfig::default()).unwrap();
    Arc::new(StorageStateStore::new(pool, crypto).unwrap())
}

/// Launcher that never yields a browser; server tests that need one attach
/// it through `SessionManager::attach_session`.
pub(crate) struct NullLauncher;

#[async_trait]
impl BrowserLauncher for NullLauncher {
    async fn launch(&self) -> Result<Arc<dyn BrowserSession>, BrowserError> {
        Err(BrowserError::BinaryNotFound)
    }
}

pub(crate) fn test_manager(store: Option<Arc<StorageStateStore>>) -> Arc<SessionManager> {
    let config = StreamingConfig::default();
    let registry = Arc::new(StreamerRegistry::new(config.clone()));
    let loader = PriorityLoader::new(
        store.clone(),
        PathBuf::from("/nonexistent/profiles"),
        PathBuf::from("/nonexistent/storage_state.json"),
    );
    Arc::new(SessionManager::new(
        config,
        registry,
        store,
        loader,
        Arc::new(NullLauncher),
    ))
}

fn metrics_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

pub(crate) fn test_server() -> VisorServer {
    VisorServer::new(ServerConfig::default(), test_manager(None), metrics_handle())
}

pub(crate) fn test_server_with_store() -> VisorServer {
    VisorServer::new(
        ServerConfig::default(),
        test_manager(Some(test_store())),
        metrics_handle(),
    )
}

pub(crate) fn seed_google_record(
    store: &Arc<StorageStateStore>,
    owner: &str,
) -> StorageStateRecord {
    let cookie = |name: &str, domain: &str| Cookie {
        name: name.into(),
        value: format!("{name}-v"),
        domain: domain.into(),
        path: "/".into(),
        expires: None,
        http_only: true,
        secure: true,
        same_site: Some("Lax".into()),
    };
    let blob = StorageStateBlob {
        cookies: vec![
            cookie("SID", ".google.com"),
            cookie("SIDCC", ".google.com"),
            cookie("OSID", ".docs.google.com"),
        ],
        origins: vec![],
        env_metadata: None,
    };
    store.save(owner, blob, RecordMetadata::default()).unwrap()
}
