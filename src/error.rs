//! Error types for Shelter
//!
//! Expected failures (connectivity, missing files, absent keys) are handled
//! inside the components and surface as sentinel results. `AppError` is what
//! crosses a public boundary when a caller has to act on the failure, and it
//! implements `IntoResponse` for the operations surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::data::Dataset;

/// Application-wide error type
#[derive(Debug, Error)]
pub enum AppError {
    /// Resource not found (404)
    #[error("Resource not found")]
    NotFound,

    /// Invalid argument / contract violation (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Live store unreachable or timed out (503)
    #[error("Live store unavailable: {0}")]
    Unavailable(String),

    /// Neither the live store nor the fallback snapshot can serve the request (503)
    #[error("Service temporarily degraded")]
    Degraded,

    /// Fallback snapshot unreadable or malformed (500)
    #[error("Corrupt fallback snapshot for {dataset}: {reason}")]
    CorruptFallback { dataset: Dataset, reason: String },

    /// Value could not be written to the cache backup (500)
    #[error("Cache serialization error: {0}")]
    CacheSerialization(String),

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error (500)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether retrying the same operation later can succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Unavailable(_) | AppError::Degraded)
    }

    /// Stable label used for metrics and the JSON error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound => "not_found",
            AppError::Validation(_) => "validation",
            AppError::Unavailable(_) => "unavailable",
            AppError::Degraded => "degraded",
            AppError::CorruptFallback { .. } => "corrupt_fallback",
            AppError::CacheSerialization(_) => "cache_serialization",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.into())
    }
}

impl IntoResponse for AppError {
    /// Maps each variant to a status code and a JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message) = match &self {
            AppError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unavailable(_) | AppError::Degraded => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Service temporarily degraded".to_string(),
            ),
            AppError::Config(_)
            | AppError::CorruptFallback { .. }
            | AppError::CacheSerialization(_)
            | AppError::Io(_)
            | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "Request failed");
        }

        crate::metrics::ERRORS_TOTAL
            .with_label_values(&[self.kind()])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
            "kind": self.kind(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_retryable() {
        assert!(AppError::Unavailable("timed out".to_string()).is_retryable());
        assert!(AppError::Degraded.is_retryable());
        assert!(!AppError::Config("database.uri is not set".to_string()).is_retryable());
        assert!(!AppError::Validation("blank id".to_string()).is_retryable());
    }

    #[test]
    fn degraded_maps_to_service_unavailable() {
        let response = AppError::Unavailable("connection refused".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = AppError::Validation("bad".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
