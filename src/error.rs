//! Error types for the quiz engine.
//!
//! Conflict-class failures are reported uniformly: a kiosk cannot tell an
//! already-used redeem token from one that never existed, and a replayed
//! answer submission is indistinguishable from a forged one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by the quiz engine and its HTTP layer
#[derive(Debug, Error)]
pub enum QuizError {
    /// Malformed or incomplete request, rejected before any store access
    #[error("Invalid request: {0}")]
    Validation(String),

    /// Identity verification failed; never reveals which check failed
    #[error("Authentication failed")]
    Auth,

    /// Checkpoint token, campaign, or question pool not found / expired
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict or already-processed submission (ownership mismatch,
    /// completed checkpoint, choice/question mismatch)
    #[error("Invalid answer submission")]
    InvalidSubmission,

    /// Transient backend failure (store, or identity provider key fetch);
    /// any open transaction was rolled back wholesale
    #[error("Storage error: {0}")]
    Storage(String),
}

impl QuizError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Auth => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidSubmission => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if the caller may safely retry the request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl IntoResponse for QuizError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            // Never leak pool/driver details to the caller
            Self::Storage(detail) => {
                tracing::error!("storage error: {}", detail);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<tokio_postgres::Error> for QuizError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for QuizError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        Self::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            QuizError::Validation("missing field".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(QuizError::Auth.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            QuizError::NotFound("campaign".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            QuizError::InvalidSubmission.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            QuizError::Storage("pool timeout".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_only_storage_is_retryable() {
        assert!(QuizError::Storage("lock timeout".into()).is_retryable());
        assert!(!QuizError::Auth.is_retryable());
        assert!(!QuizError::InvalidSubmission.is_retryable());
        assert!(!QuizError::NotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_auth_message_is_generic() {
        // The message must not say which check (signature, issuer, audience,
        // expiry) failed.
        assert_eq!(QuizError::Auth.to_string(), "Authentication failed");
    }
}
