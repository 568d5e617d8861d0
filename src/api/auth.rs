//! API-key authentication middleware.
//!
//! Admin routes require an `X-API-Key` header. The SHA-256 digest of the
//! presented key is looked up in the store; every attempt, allowed or not,
//! lands in the audit trail.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use super::error::ApiError;
use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated key id, attached to request extensions for handlers.
#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub key_id: String,
}

fn client_ip(req: &Request) -> Option<String> {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_string())
}

pub async fn require_api_key(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let endpoint = req.uri().path().to_string();
    let remote_ip = client_ip(&req);

    let Some(key_material) = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
    else {
        let _ = state
            .db
            .audit_api_key_attempt(None, &endpoint, "missing", remote_ip.as_deref());
        return Err(ApiError::Unauthorized("missing X-API-Key header".into()));
    };

    match state.db.validate_api_key(&key_material) {
        Ok(Some(key_id)) => {
            state
                .db
                .audit_api_key_attempt(Some(&key_id), &endpoint, "ok", remote_ip.as_deref())
                .map_err(ApiError::Internal)?;
            req.extensions_mut().insert(AuthenticatedKey { key_id });
            Ok(next.run(req).await)
        }
        Ok(None) => {
            let _ = state
                .db
                .audit_api_key_attempt(None, &endpoint, "denied", remote_ip.as_deref());
            warn!(%endpoint, "rejected request with unknown or inactive api key");
            Err(ApiError::Unauthorized("invalid or inactive API key".into()))
        }
        Err(e) => {
            let _ = state
                .db
                .audit_api_key_attempt(None, &endpoint, "error", remote_ip.as_deref());
            Err(ApiError::Internal(e))
        }
    }
}
