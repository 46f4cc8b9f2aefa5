//! Axum HTTP + WebSocket server for the visual streaming core.
//!
//! Endpoints:
//! - `GET /health`, `GET /metrics`
//! - `WS /workflows/visual/{session_id}/stream` — event stream channel
//! - `WS /workflows/visual/{session_id}/control` — input control channel
//! - `GET /workflows/visual/{session_id}/status`, `GET /workflows/visual/sessions`
//! - `GET /crypto/public-key`
//! - `GET /auth/storage-state/latest`, `PUT /auth/storage-state/{record_id}`

pub mod config;
pub mod health;
pub mod server;
pub mod shutdown;
pub mod storage_api;
pub mod ws;

#[cfg(test)]
mod test_support;

pub use config::ServerConfig;
pub use server::{AppState, VisorServer};
pub use shutdown::ShutdownCoordinator;
