use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-level errors
#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded { retry_after: Duration },

    #[error("Question catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("Generation service error: {0}")]
    UpstreamService(String),

    #[error("Generation payload rejected: {0}")]
    PayloadValidation(String),

    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable machine-readable code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation_error",
            AppError::SessionNotFound(_) => "session_not_found",
            AppError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AppError::CatalogUnavailable(_) => "catalog_unavailable",
            AppError::UpstreamService(_) | AppError::HttpClient(_) => "upstream_service_error",
            AppError::PayloadValidation(_) => "payload_validation_error",
            AppError::CircuitOpen { .. } => "circuit_open",
            AppError::Database(_)
            | AppError::Store(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamService(_)
            | AppError::HttpClient(_)
            | AppError::PayloadValidation(_)
            | AppError::CircuitOpen { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_)
            | AppError::Store(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }

        let retry_after = match &self {
            AppError::RateLimitExceeded { retry_after } => Some(*retry_after),
            _ => None,
        };

        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(retry_after) = retry_after {
            error["retry_after_ms"] = json!(retry_after.as_millis() as u64);
        }

        let mut response = (status, Json(json!({ "error": error }))).into_response();

        if let Some(retry_after) = retry_after {
            // Retry-After is whole seconds; round up so clients never retry early
            let secs = retry_after.as_millis().div_ceil(1000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

pub type AppResult<T> = Result<T, AppError>;
