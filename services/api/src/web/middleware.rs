//! services/api/src/web/middleware.rs
//!
//! Experimenter authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::error;

use crate::web::state::AppState;

/// Middleware that validates the experimenter's API token and loads their profile.
///
/// If valid, inserts the `Profile` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_experimenter(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Extract bearer token
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let api_token = auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // 2. Look up the profile behind the token
    let profile = state
        .db
        .get_profile_by_token(api_token)
        .await
        .map_err(|e| {
            error!("Failed to resolve experimenter token: {:?}", e);
            StatusCode::UNAUTHORIZED
        })?;

    // 3. Insert the profile into request extensions
    req.extensions_mut().insert(profile);

    // 4. Continue to the handler
    Ok(next.run(req).await)
}
