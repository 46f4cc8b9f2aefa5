//! `visord` — run the visual streaming server.
//!
//! Configuration comes entirely from the environment: `HOST`/`PORT` for the
//! listener, the streaming keys from `StreamingConfig::from_env`, crypto
//! material from `COOKIE_*`, and `STORAGE_STATE_DB` for the record database
//! (in-memory when unset).

use std::path::PathBuf;
use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use visor_browser::{find_chrome, BrowserVariant, LaunchOptions};
use visor_core::StreamingConfig;
use visor_crypto::EnvelopeCrypto;
use visor_runtime::{CdpLauncher, SessionManager};
use visor_server::{ServerConfig, VisorServer};
use visor_store::{new_file, new_in_memory, ConnectionConfig, PriorityLoader, StorageStateStore};
use visor_stream::StreamerRegistry;

fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();
    let _ = subscriber.try_init();
}

fn build_store() -> Option<Arc<StorageStateStore>> {
    let crypto = match EnvelopeCrypto::from_env() {
        Ok(crypto) => Arc::new(crypto),
        Err(err) => {
            warn!(error = %err, "crypto key material unavailable, storage-state store disabled");
            return None;
        }
    };
    let pool = match std::env::var("STORAGE_STATE_DB") {
        Ok(path) => new_file(&path, &ConnectionConfig::default()),
        Err(_) => new_in_memory(&ConnectionConfig::default()),
    };
    let pool = match pool {
        Ok(pool) => pool,
        Err(err) => {
            warn!(error = %err, "storage-state database unavailable, store disabled");
            return None;
        }
    };
    match StorageStateStore::new(pool, crypto) {
        Ok(store) => Some(Arc::new(store)),
        Err(err) => {
            warn!(error = %err, "storage-state store init failed, store disabled");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_subscriber("info");

    let streaming = StreamingConfig::from_env();
    let server_config = ServerConfig {
        host: std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
        port: std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8010),
        ..ServerConfig::default()
    };

    let store = build_store();
    let registry = Arc::new(StreamerRegistry::new(streaming.clone()));

    let environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "production".into());
    let chrome = find_chrome()?;
    let launcher = CdpLauncher::new(LaunchOptions {
        variant: BrowserVariant::for_environment(&environment),
        ..LaunchOptions::new(chrome)
    });

    let profile_dir = dirs_home().join(".visor").join("profiles");
    let loader = PriorityLoader::new(
        store.clone(),
        profile_dir,
        PathBuf::from("storage_state.json"),
    );
    let manager = Arc::new(SessionManager::new(
        streaming,
        registry,
        store,
        loader,
        Arc::new(launcher),
    ));

    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    let server = VisorServer::new(server_config, manager, metrics_handle);
    let (addr, handle) = server.listen().await?;
    info!(%addr, "visor server listening");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.shutdown().graceful_shutdown(None).await;
    let _ = handle.await;
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}
