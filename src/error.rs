//! Error types for fedirelay
//!
//! Internal failures are converted to `AppError`, which implements
//! `IntoResponse` for JSON error bodies. The inbox speaks the federation
//! protocol's plain-text dialect instead and uses [`InboxRejection`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[error_type]).inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Inbox rejection with a plain-text body
#[derive(Debug, Error)]
pub enum InboxRejection {
    /// Malformed or unverifiable payload (400)
    #[error("{0}")]
    Decode(String),

    /// Sender not allowed to do what it asked (401)
    #[error("{0}")]
    Unauthorized(String),
}

impl InboxRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            InboxRejection::Decode(_) => StatusCode::BAD_REQUEST,
            InboxRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }
}

impl From<AppError> for InboxRejection {
    /// Everything that goes wrong while decoding an inbound request is a
    /// decode failure from the sender's point of view.
    fn from(err: AppError) -> Self {
        InboxRejection::Decode(err.to_string())
    }
}

impl IntoResponse for InboxRejection {
    fn into_response(self) -> Response {
        let status = self.status();
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_rejection_maps_to_plain_text_statuses() {
        let unauthorized = InboxRejection::Unauthorized("follow first".to_string());
        assert_eq!(unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(unauthorized.to_string(), "follow first");

        let decode: InboxRejection = AppError::InvalidSignature.into();
        assert_eq!(decode.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn app_error_validation_is_bad_request() {
        let response = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
