//! API key authentication middleware.

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::app::AppState;
use crate::error::ApiError;
use crate::extractors::api_key::ApiKeyAuth;

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Rejects requests without a configured `X-API-Key`.
///
/// On success the authenticated identity is stored in request extensions for
/// the [`ApiKeyAuth`] extractor.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    let Some(presented) = presented else {
        return ApiError::Unauthorized("Invalid or missing API key".into()).into_response();
    };

    match ApiKeyAuth::authenticate(presented, &state.config.security.api_key_hashes) {
        Some(auth) => {
            req.extensions_mut().insert(auth);
            next.run(req).await
        }
        None => {
            tracing::debug!("Rejected request with unknown API key");
            ApiError::Unauthorized("Invalid or missing API key".into()).into_response()
        }
    }
}
