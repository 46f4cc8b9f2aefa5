//! Storage-state HTTP endpoints.
//!
//! Auth-token validation lives in the external façade; by the time a request
//! reaches these handlers the caller's identity arrives in the `x-user-id`
//! header.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use visor_crypto::SealedEnvelope;
use visor_store::{RecordMetadata, StoreError};

use crate::server::AppState;

fn owner_id(headers: &HeaderMap) -> Result<String, (StatusCode, Json<serde_json::Value>)> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .ok_or((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "missing caller identity" })),
        ))
}

/// Query parameters for `GET /auth/storage-state/latest`.
#[derive(Debug, Deserialize)]
pub struct LatestParams {
    /// Comma-separated site filter.
    pub sites: Option<String>,
}

/// GET /auth/storage-state/latest?sites=a,b
///
/// Returns the decrypted blob and metadata of the caller's most recent
/// verified record within TTL.
pub async fn latest(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "storage-state store not configured" })),
        );
    };

    let sites: Vec<String> = params
        .sites
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().to_ascii_lowercase())
        .collect();

    let record = match store.latest_verified(&owner, &sites, state.streaming.cookie_verify_ttl_hours)
    {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "no verified storage state" })),
            );
        }
        Err(err) => {
            warn!(error = %err, "latest_verified lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "lookup failed" })),
            );
        }
    };

    match store.load_plaintext(&record) {
        Ok(blob) => (
            StatusCode::OK,
            Json(json!({
                "record_id": record.record_id,
                "metadata": record.metadata,
                "verified": record.verified,
                "created_at": record.created_at.to_rfc3339(),
                "state": blob,
            })),
        ),
        Err(err) => {
            warn!(record_id = %record.record_id, error = %err, "storage state decrypt failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": "decrypt_failed" })),
            )
        }
    }
}

/// Body of `PUT /auth/storage-state/{record_id}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceBody {
    /// Base64 AES-GCM ciphertext.
    pub ciphertext: String,
    /// Base64 GCM nonce.
    pub nonce: String,
    /// Base64 wrapped data key.
    pub wrapped_key: String,
    /// Key pair id.
    pub kid: String,
    /// Replacement metadata.
    #[serde(default)]
    pub metadata: Option<RecordMetadata>,
}

/// PUT /auth/storage-state/{record_id}
///
/// Ownership-checked envelope replacement; re-runs verification.
pub async fn replace(
    State(state): State<AppState>,
    Path(record_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<ReplaceBody>,
) -> impl IntoResponse {
    let owner = match owner_id(&headers) {
        Ok(owner) => owner,
        Err(resp) => return resp,
    };
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "storage-state store not configured" })),
        );
    };

    let envelope = SealedEnvelope {
        ciphertext: body.ciphertext,
        nonce: body.nonce,
        wrapped_key: body.wrapped_key,
        kid: body.kid,
    };
    match store.replace(&owner, &record_id, envelope, body.metadata.unwrap_or_default()) {
        Ok(record) => (
            StatusCode::OK,
            Json(json!({
                "id": record.record_id,
                "status": record.status,
                "verified": record.verified,
            })),
        ),
        Err(StoreError::RecordNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        ),
        Err(StoreError::Crypto(err)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": err.kind(), "detail": err.to_string() })),
        ),
        Err(err) => {
            warn!(record_id, error = %err, "storage state replace failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "replace failed" })),
            )
        }
    }
}

/// GET /crypto/public-key
///
/// The current public key for client-side envelope encryption.
pub async fn public_key(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = &state.store else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "crypto keys not configured" })),
        );
    };
    let crypto = store.crypto();
    match crypto.keys().public_key_pem() {
        Ok(pem) => (
            StatusCode::OK,
            Json(json!({
                "kid": crypto.kid(),
                "alg": "RSA-OAEP-256",
                "pem": pem,
            })),
        ),
        Err(err) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": err.kind() })),
        ),
    }
}
