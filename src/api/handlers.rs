//! HTTP request handlers for the gateway.
//!
//! This module contains the passthrough proxy endpoint, the health check
//! and the metrics scrape endpoint.

use crate::core::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
use crate::core::jwt::AuthResult;
use crate::core::metrics::MetricsCollector;
use crate::core::{AppError, Result};
use crate::services::upstream::UpstreamClient;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<UpstreamClient>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Health check with per-upstream breaker state.
///
/// Reports `degraded` while any breaker is open; still answers 200 so the
/// gateway itself is not taken out of rotation.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let breakers = state.breakers.snapshots();
    let status = if breakers.iter().any(|b| b.state == CircuitState::Open) {
        "degraded"
    } else {
        "ok"
    };
    Json(HealthResponse { status, breakers })
}

/// Prometheus text exposition of the gateway's own registry.
pub async fn metrics_handler(State(state): State<AppState>) -> Result<Response> {
    let Some(metrics) = &state.metrics else {
        return Ok(StatusCode::NOT_FOUND.into_response());
    };
    let body = metrics.scrape()?;
    let content_type = HeaderValue::from_static(prometheus::TEXT_FORMAT);
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Forward `POST /v1/*path` to a provider serving the body's `model`.
///
/// The body is passed through untouched; only the `model` field is read
/// for provider selection.
#[tracing::instrument(skip(state, auth, body))]
pub async fn proxy_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
    auth: Option<Extension<AuthResult>>,
    body: Bytes,
) -> Result<Response> {
    let payload: Value = serde_json::from_slice(&body)
        .map_err(|_| AppError::BadRequest("Request body must be a JSON object".to_string()))?;
    let model = payload
        .get("model")
        .and_then(|m| m.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing 'model' field".to_string()))?
        .to_string();

    if let Some(identity) = auth.as_ref().and_then(|Extension(a)| a.identity()) {
        tracing::debug!(subject = %identity.subject, model = %model, "Proxying for authenticated caller");
    }

    let upstream = state.upstream.dispatch(&model, &path, body).await?;

    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/json"));

    let mut response = (status, upstream.body).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, content_type);
    if let Ok(provider) = HeaderValue::from_str(&upstream.provider) {
        response.headers_mut().insert("x-upstream-provider", provider);
    }
    Ok(response)
}
