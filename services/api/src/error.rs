//! services/api/src/error.rs
//!
//! Defines the primary error type for the entire API service, and how each
//! error renders as an HTTP response. Handlers return `ApiError` and the
//! `IntoResponse` impl below is the single place where port failures are
//! translated into user-visible messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::config::ConfigError;
use crowdpanel_core::ports::PortError;

/// The primary error type for the `api` service.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Represents an error that occurred during configuration loading.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// Represents an error from the underlying database library.
    #[error("Database Error: {0}")]
    Database(#[from] sqlx::Error),

    /// The request itself was malformed or not allowed in the session's
    /// current state.
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Represents a standard Input/Output error (e.g., binding to a network socket).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A catch-all for any other unexpected errors.
    #[error("An unexpected internal error occurred: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Port(port_error) => match port_error {
                PortError::NotFound(what) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", what.clone())
                }
                PortError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
                PortError::Unreachable(_) | PortError::Client { .. } | PortError::Server { .. } => {
                    (
                        StatusCode::BAD_GATEWAY,
                        "HOSTING_SERVICE_ERROR",
                        format!("The experiment host reported an error: {}", port_error),
                    )
                }
                PortError::Marketplace { source, .. } => (
                    StatusCode::BAD_GATEWAY,
                    "MARKETPLACE_ERROR",
                    format!("{} (caused by: {})", port_error, source),
                ),
                PortError::Unexpected(msg) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    msg.clone(),
                ),
            },
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone()),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
