use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::queue::QueueBackendError;
use crate::ratelimit::RateLimitQuota;

pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// Set `X-RateLimit-Limit`, `X-RateLimit-Remaining` and `X-RateLimit-Reset`
/// (Unix seconds)
pub fn insert_rate_limit_headers(headers: &mut HeaderMap, quota: &RateLimitQuota) {
    let values = [
        (RATE_LIMIT_LIMIT_HEADER, quota.limit.to_string()),
        (RATE_LIMIT_REMAINING_HEADER, quota.remaining.to_string()),
        (RATE_LIMIT_RESET_HEADER, quota.reset_at_secs().to_string()),
    ];
    for (name, value) in values {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(name, v);
        }
    }
}

/// A single field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    #[error("Batch size cannot exceed {max} messages")]
    BatchTooLarge { max: usize },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64, quota: RateLimitQuota },

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<QueueBackendError> for AppError {
    fn from(err: QueueBackendError) -> Self {
        AppError::QueueUnavailable(err.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    success: bool,
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<FieldError>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

fn masked(log_message: &str, public: &str) -> String {
    if is_production() {
        public.to_string()
    } else {
        log_message.to_string()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let log_message = self.to_string();
        let mut details = None;
        let mut retry_after = None;
        let mut quota = None;

        let (status, client_message) = match self {
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                masked(&log_message, "Configuration error"),
            ),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, log_message.clone()),
            AppError::Validation(fields) => {
                details = Some(fields);
                (StatusCode::BAD_REQUEST, log_message.clone())
            }
            AppError::BatchTooLarge { .. } => (StatusCode::BAD_REQUEST, log_message.clone()),
            AppError::RateLimited {
                retry_after: secs,
                quota: window,
            } => {
                retry_after = Some(secs);
                quota = Some(window);
                (StatusCode::TOO_MANY_REQUESTS, log_message.clone())
            }
            AppError::QueueUnavailable(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                masked(&log_message, "Message queue unavailable"),
            ),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, log_message.clone()),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                masked(&log_message, "Internal server error"),
            ),
        };

        if status.is_server_error() {
            tracing::error!(
                status = %status.as_u16(),
                message = %log_message,
                "API error"
            );
        } else {
            tracing::warn!(
                status = %status.as_u16(),
                message = %log_message,
                "API request rejected"
            );
        }

        let body = ErrorResponse {
            success: false,
            error: client_message,
            details,
            retry_after,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            if let Ok(v) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        if let Some(quota) = quota {
            insert_rate_limit_headers(response.headers_mut(), &quota);
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_too_large_message() {
        let err = AppError::BatchTooLarge { max: 10 };
        assert_eq!(err.to_string(), "Batch size cannot exceed 10 messages");
    }

    #[test]
    fn test_status_codes() {
        let response = AppError::Validation(vec![FieldError::new("content", "required")]).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let quota = RateLimitQuota {
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_042_000,
        };
        let response = AppError::RateLimited { retry_after: 42, quota }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
        assert_eq!(response.headers().get(RATE_LIMIT_LIMIT_HEADER).unwrap(), "10");
        assert_eq!(response.headers().get(RATE_LIMIT_REMAINING_HEADER).unwrap(), "0");
        assert_eq!(response.headers().get(RATE_LIMIT_RESET_HEADER).unwrap(), "1700000042");

        let response = AppError::QueueUnavailable("down".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = AppError::NotFound("message".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
