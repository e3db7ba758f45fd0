//! JWT Authentication Middleware
//!
//! Extracts a bearer token from the Authorization header, validates it and
//! hands the caller's [`JwtClaims`] to handlers through a request extension.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use burrow_auth::{JwtClaims, JwtValidator};
use std::sync::Arc;
use tracing::debug;

use crate::models::ErrorResponse;

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(validator: JwtValidator) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self::new(JwtValidator::new(secret))
    }
}

/// Reject the request with 401 unless it carries a valid
/// `Authorization: Bearer <token>` header.
pub async fn require_auth(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new(
                    "Missing Authorization header",
                    "MISSING_AUTH",
                )),
            )
        })?;

    let token = auth_header.strip_prefix("Bearer ").ok_or_else(|| {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                "Invalid Authorization header format. Expected 'Bearer <token>'",
                "INVALID_AUTH_FORMAT",
            )),
        )
    })?;

    let claims: JwtClaims = state.validator.validate(token).map_err(|e| {
        debug!("Rejected API token: {}", e);
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorResponse::new(
                format!("Invalid or expired token: {}", e),
                "INVALID_TOKEN",
            )),
        )
    })?;

    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
