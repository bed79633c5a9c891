//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] that wraps the
//! pipeline's denial outcomes and upstream failures, and implements the HTTP
//! response conversion. Internal details stay in server-side logs.

use crate::core::error_types::{
    ValidationErrorKind, ERROR_CODE_BREAKER_OPEN, ERROR_CODE_INTERNAL, ERROR_CODE_RATE_LIMITED,
    ERROR_CODE_UNAUTHORIZED, ERROR_CODE_UPSTREAM, ERROR_TYPE_API, ERROR_TYPE_AUTHENTICATION,
    ERROR_TYPE_INVALID_REQUEST, ERROR_TYPE_OVERLOADED, ERROR_TYPE_RATE_LIMIT, ERROR_TYPE_TIMEOUT,
};
use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the application.
#[derive(Error, Debug)]
pub enum AppError {
    /// Configuration-related errors (file not found, parse errors, etc.)
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rate limit exceeded; retry after the given delay
    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded { limit: u32, retry_after: Duration },

    /// Request rejected by structural validation
    #[error("Validation failed: {0}")]
    ValidationFailed(ValidationErrorKind),

    /// Circuit breaker for the target is open
    #[error("Upstream '{target}' is temporarily unavailable")]
    BreakerOpen {
        target: String,
        retry_after: Option<Duration>,
    },

    /// Authentication required but absent or invalid
    #[error("Unauthorized")]
    Unauthorized,

    /// Client provided invalid data
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Upstream answered with a non-success status
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Request timeout errors
    #[error("Gateway timeout")]
    Timeout,

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// HTTP status this error is surfaced as.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Request(e) if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            AppError::Request(_) => StatusCode::BAD_GATEWAY,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::ValidationFailed(kind) => match kind {
                ValidationErrorKind::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                ValidationErrorKind::HeadersTooLarge => {
                    StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
                }
                ValidationErrorKind::QueryTooLong => StatusCode::URI_TOO_LONG,
                ValidationErrorKind::PathTraversal => StatusCode::BAD_REQUEST,
            },
            AppError::BreakerOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Machine-readable `(type, code)` pair for the response body.
    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            AppError::RateLimitExceeded { .. } => (ERROR_TYPE_RATE_LIMIT, ERROR_CODE_RATE_LIMITED),
            AppError::ValidationFailed(kind) => (ERROR_TYPE_INVALID_REQUEST, kind.as_str()),
            AppError::BreakerOpen { .. } => (ERROR_TYPE_OVERLOADED, ERROR_CODE_BREAKER_OPEN),
            AppError::Unauthorized => (ERROR_TYPE_AUTHENTICATION, ERROR_CODE_UNAUTHORIZED),
            AppError::BadRequest(_) => (ERROR_TYPE_INVALID_REQUEST, "bad_request"),
            AppError::Upstream { .. } | AppError::Request(_) => {
                (ERROR_TYPE_API, ERROR_CODE_UPSTREAM)
            }
            AppError::Timeout => (ERROR_TYPE_TIMEOUT, "timeout"),
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                (ERROR_TYPE_API, ERROR_CODE_INTERNAL)
            }
        }
    }

    /// Message safe to show to clients.
    fn public_message(&self) -> String {
        match self {
            AppError::Config(_) | AppError::Serialization(_) | AppError::Internal(_) => {
                "Internal server error".to_string()
            }
            AppError::Request(e) if e.is_timeout() => "Gateway timeout".to_string(),
            AppError::Request(_) => "Upstream request failed".to_string(),
            AppError::ValidationFailed(kind) => kind.message().to_string(),
            other => other.to_string(),
        }
    }
}

fn retry_after_header(retry_after: Duration) -> HeaderValue {
    // Retry-After is whole seconds; round up so clients never retry early
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    HeaderValue::from(secs.max(1))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let (error_type, code) = self.kind();

        if status.is_server_error() && !matches!(self, AppError::BreakerOpen { .. }) {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": error_type,
                "code": code
            }
        }));

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        match &self {
            AppError::RateLimitExceeded { limit, retry_after } => {
                headers.insert(header::RETRY_AFTER, retry_after_header(*retry_after));
                headers.insert("x-ratelimit-limit", HeaderValue::from(*limit));
                headers.insert("x-ratelimit-remaining", HeaderValue::from(0u32));
            }
            AppError::BreakerOpen {
                retry_after: Some(retry_after),
                ..
            } => {
                headers.insert(header::RETRY_AFTER, retry_after_header(*retry_after));
            }
            _ => {}
        }

        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_display() {
        assert_eq!(AppError::Unauthorized.to_string(), "Unauthorized");
        assert_eq!(
            AppError::Internal("test error".to_string()).to_string(),
            "Internal server error: test error"
        );
        assert_eq!(
            AppError::ValidationFailed(ValidationErrorKind::BodyTooLarge).to_string(),
            "Validation failed: body_too_large"
        );
    }

    #[tokio::test]
    async fn test_rate_limit_response_headers() {
        let err = AppError::RateLimitExceeded {
            limit: 10,
            retry_after: Duration::from_millis(1500),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "2");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");

        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], "rate_limited");
    }

    #[test]
    fn test_retry_after_never_zero() {
        assert_eq!(retry_after_header(Duration::from_millis(10)), "1");
        assert_eq!(retry_after_header(Duration::from_secs(3)), "3");
    }

    #[tokio::test]
    async fn test_validation_statuses() {
        let cases = [
            (ValidationErrorKind::BodyTooLarge, StatusCode::PAYLOAD_TOO_LARGE),
            (
                ValidationErrorKind::HeadersTooLarge,
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE,
            ),
            (ValidationErrorKind::QueryTooLong, StatusCode::URI_TOO_LONG),
            (ValidationErrorKind::PathTraversal, StatusCode::BAD_REQUEST),
        ];
        for (kind, status) in cases {
            let response = AppError::ValidationFailed(kind).into_response();
            assert_eq!(response.status(), status);
            let body = body_json(response).await;
            assert_eq!(body["error"]["code"], kind.as_str());
        }
    }

    #[tokio::test]
    async fn test_breaker_open_response() {
        let err = AppError::BreakerOpen {
            target: "openai".to_string(),
            retry_after: Some(Duration::from_secs(12)),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()["retry-after"], "12");
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "breaker_open");
        assert_eq!(
            body["error"]["message"],
            "Upstream 'openai' is temporarily unavailable"
        );
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = AppError::Internal("db password=hunter2".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "Internal server error");
    }

    #[test]
    fn test_upstream_status_passthrough() {
        let err = AppError::Upstream {
            status: 502,
            message: "bad gateway".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);

        let err = AppError::Upstream {
            status: 42,
            message: "nonsense".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_from_anyhow() {
        let app_err: AppError = anyhow::anyhow!("test error").into();
        assert!(matches!(app_err, AppError::Config(_)));
    }
}
