//! HTTP middleware making up the request pipeline.
//!
//! Each stage is a plain `axum::middleware::from_fn*` function with its own
//! small state. The fixed order they are layered in lives in
//! [`crate::services::components::Components::apply`].

use crate::core::error::AppError;
use crate::core::error_types::{ERROR_CODE_INTERNAL, ERROR_TYPE_API, ValidationErrorKind};
use crate::core::jwt::{AuthResult, JwtAuthenticator};
use crate::core::logging::{current_request_id, generate_request_id, REQUEST_ID};
use crate::core::metrics::MetricsCollector;
use crate::core::rate_limiter::{rate_limit_key, RateLimiter};
use crate::core::validator::RequestValidator;
use axum::{
    body::Body,
    extract::{MatchedPath, Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
pub static X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub static X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// Longest client-supplied request id that is echoed instead of replaced
const MAX_REQUEST_ID_LEN: usize = 128;

/// Extension type carrying the request id to handlers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestId(pub String);

// ============================================================================
// Request ID
// ============================================================================

/// Tag the request with an id and echo it on the response.
///
/// A well-formed incoming `X-Request-ID` is kept; otherwise a UUID v4 is
/// generated. The id is scoped as [`REQUEST_ID`] for everything downstream.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_valid_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(generate_request_id);

    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let mut response = REQUEST_ID
        .scope(request_id.clone(), next.run(request))
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Clone)]
pub struct ValidationState {
    pub validator: Arc<RequestValidator>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl ValidationState {
    fn reject(&self, kind: ValidationErrorKind, path: &str) -> Response {
        tracing::warn!(
            request_id = %current_request_id(),
            kind = kind.as_str(),
            path = %path,
            "Request rejected by validation"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_validation_failure(kind.as_str());
        }
        AppError::ValidationFailed(kind).into_response()
    }
}

/// Structural checks before any budget is spent. Bodies of undeclared
/// length are buffered through the size limit.
pub async fn validation_middleware(
    State(state): State<ValidationState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    if let Err(kind) = state.validator.validate_parts(&parts) {
        return state.reject(kind, parts.uri.path());
    }

    let body = if state.validator.needs_streaming_check(&parts) {
        match state.validator.read_limited(body).await {
            Ok(bytes) => Body::from(bytes),
            Err(kind) => return state.reject(kind, parts.uri.path()),
        }
    } else {
        body
    };

    next.run(Request::from_parts(parts, body)).await
}

// ============================================================================
// Rate Limiting
// ============================================================================

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

/// Per-key admission. Denials answer 429; admitted responses carry the
/// remaining budget in `X-RateLimit-*` headers.
pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let key = rate_limit_key(&parts);

    match state.limiter.check_rate_limit(&key) {
        Ok(decision) => {
            let mut response = next.run(Request::from_parts(parts, body)).await;
            let headers = response.headers_mut();
            headers.insert(X_RATELIMIT_LIMIT.clone(), HeaderValue::from(decision.limit));
            headers.insert(
                X_RATELIMIT_REMAINING.clone(),
                HeaderValue::from(decision.remaining),
            );
            response
        }
        Err(e) => {
            if let Some(metrics) = &state.metrics {
                metrics.record_rate_limited();
            }
            e.into_response()
        }
    }
}

// ============================================================================
// Metrics Middleware
// ============================================================================

/// Middleware for tracking request metrics.
#[derive(Clone)]
pub struct MetricsMiddleware {
    pub metrics: Arc<MetricsCollector>,
    /// Scrape path, excluded from request metrics
    pub scrape_path: String,
}

/// Label for requests no route matched, so stray paths share one series.
pub const UNMATCHED_ROUTE: &str = "unmatched";

impl MetricsMiddleware {
    /// Track metrics for incoming requests.
    ///
    /// This middleware:
    /// - Increments the inflight gauge until the response is produced
    /// - Measures request duration
    /// - Records request count by status code
    pub async fn track_metrics(
        State(state): State<MetricsMiddleware>,
        request: Request,
        next: Next,
    ) -> Response {
        if request.uri().path() == state.scrape_path {
            return next.run(request).await;
        }

        let method = request.method().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_string())
            .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

        let _inflight = state.metrics.track_inflight(&route);
        let start = Instant::now();

        let response = next.run(request).await;

        let duration = start.elapsed();
        let status = response.status().as_u16();
        state
            .metrics
            .record_request(&method, &route, status, duration);

        tracing::debug!(
            method = %method,
            path = %route,
            status = status,
            duration_ms = duration.as_millis() as u64,
            "Request completed"
        );

        response
    }
}

// ============================================================================
// JWT Authentication
// ============================================================================

/// Annotate the request with an [`AuthResult`]; never rejects.
pub async fn optional_auth_middleware(
    State(auth): State<Arc<JwtAuthenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let result = auth.authenticate(request.headers());
    if let AuthResult::Authenticated(identity) = &result {
        tracing::debug!(subject = %identity.subject, "Request authenticated");
    }
    request.extensions_mut().insert(result);
    next.run(request).await
}

/// Reject anonymous callers with 401. Reuses the annotation from
/// [`optional_auth_middleware`] when it already ran.
pub async fn require_auth_middleware(
    State(auth): State<Arc<JwtAuthenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let result = match request.extensions().get::<AuthResult>() {
        Some(result) => result.clone(),
        None => auth.authenticate(request.headers()),
    };

    if result.is_anonymous() {
        tracing::debug!(
            request_id = %current_request_id(),
            path = %request.uri().path(),
            "Rejecting anonymous request"
        );
        return AppError::Unauthorized.into_response();
    }

    request.extensions_mut().insert(result);
    next.run(request).await
}

// ============================================================================
// Panic Recovery
// ============================================================================

/// Response for a panic caught by `CatchPanicLayer`. The panic message is
/// logged, never returned.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };

    tracing::error!(
        request_id = %current_request_id(),
        panic = %message,
        "Recovered from panic in request pipeline"
    );

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": {
                "message": "Internal server error",
                "type": ERROR_TYPE_API,
                "code": ERROR_CODE_INTERNAL
            }
        })),
    )
        .into_response()
}
