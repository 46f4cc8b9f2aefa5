//! `VisorServer` — router, shared state, and HTTP handlers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{info, instrument};

use visor_core::{SessionId, StreamingConfig};
use visor_runtime::SessionManager;
use visor_store::StorageStateStore;
use visor_stream::StreamerRegistry;

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::shutdown::ShutdownCoordinator;
use crate::storage_api;
use crate::ws;

/// Shared state accessible from handlers.
#[derive(Clone)]
pub struct AppState {
    /// Session manager (browser + lifecycle resolution).
    pub manager: Arc<SessionManager>,
    /// Streamer registry (stream channel resolution).
    pub registry: Arc<StreamerRegistry>,
    /// Storage-state store, when persistence is configured.
    pub store: Option<Arc<StorageStateStore>>,
    /// Server configuration.
    pub server_config: ServerConfig,
    /// Streaming configuration (rate limits, TTLs).
    pub streaming: StreamingConfig,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus metrics handle.
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// The visor HTTP + WebSocket server.
pub struct VisorServer {
    state: AppState,
}

impl VisorServer {
    /// Assemble a server around a session manager.
    #[must_use]
    pub fn new(
        server_config: ServerConfig,
        manager: Arc<SessionManager>,
        metrics_handle: PrometheusHandle,
    ) -> Self {
        let registry = Arc::clone(manager.registry());
        let store = manager.store().cloned();
        let streaming = manager.config().clone();
        Self {
            state: AppState {
                manager,
                registry,
                store,
                server_config,
                streaming,
                shutdown: Arc::new(ShutdownCoordinator::new()),
                start_time: Instant::now(),
                metrics_handle: Arc::new(metrics_handle),
            },
        }
    }

    /// Build the router with all routes and middleware.
    #[must_use]
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/crypto/public-key", get(storage_api::public_key))
            .route("/workflows/visual/sessions", get(sessions_handler))
            .route(
                "/workflows/visual/{session_id}/status",
                get(status_handler),
            )
            .route(
                "/workflows/visual/{session_id}/stream",
                get(ws::stream::upgrade),
            )
            .route(
                "/workflows/visual/{session_id}/control",
                get(ws::control::upgrade),
            )
            .route("/auth/storage-state/latest", get(storage_api::latest))
            .route(
                "/auth/storage-state/{record_id}",
                put(storage_api::replace),
            )
            .with_state(self.state.clone())
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(2 * 1024 * 1024))
            .layer(TimeoutLayer::new(Duration::from_secs(30)))
    }

    /// Bind and serve. Returns the bound address and the server task handle.
    ///
    /// # Errors
    ///
    /// Returns the bind error when the address is unavailable.
    #[instrument(skip_all, fields(host = %self.state.server_config.host, port = self.state.server_config.port))]
    pub async fn listen(
        &self,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!(
            "{}:{}",
            self.state.server_config.host, self.state.server_config.port
        );
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;
        info!(addr = %bound_addr, "server started");

        let router = self.router();
        let shutdown_token = self.state.shutdown.token();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_token.cancelled().await;
                    info!("server shutdown initiated");
                })
                .await;
            info!("server shutdown complete");
        });
        Ok((bound_addr, handle))
    }

    /// The shared state (tests, embedders).
    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// The shutdown coordinator.
    #[must_use]
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.state.shutdown
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(state.start_time, state.registry.len()))
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /workflows/visual/{session_id}/status
async fn status_handler(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let session_id = match SessionId::parse(&session_id) {
        Ok(id) => id,
        Err(err) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "invalid_message", "detail": err.to_string() })),
            );
        }
    };
    match state.registry.lookup(&session_id) {
        Some(streamer) => (
            StatusCode::OK,
            Json(serde_json::to_value(streamer.status()).unwrap_or_default()),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": "session_not_found",
                "session_id": session_id.as_str(),
            })),
        ),
    }
}

/// GET /workflows/visual/sessions
async fn sessions_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let statuses: Vec<_> = state
        .registry
        .all()
        .iter()
        .map(|streamer| streamer.status())
        .collect();
    let active = statuses.iter().filter(|s| s.streaming_active).count();
    let total_events: u64 = statuses.iter().map(|s| s.events_processed).sum();
    Json(json!({
        "sessions": statuses,
        "total_sessions": statuses.len(),
        "active_sessions": active,
        "total_events_processed": total_events,
    }))
}
