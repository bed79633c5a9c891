//! Upstream dispatch through the circuit breakers.
//!
//! Every outbound call goes through the breaker of the provider it targets
//! and is reported to the metrics collector. When several providers serve a
//! model they are tried in configuration order; an open breaker or an
//! unavailable upstream moves on to the next one.

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::circuit_breaker::{BreakerError, CircuitBreakerRegistry, FailureClassifier};
use crate::core::config::{AppConfig, ProviderConfig};
use crate::core::error::{AppError, Result};
use crate::core::error_types::{
    ERROR_CATEGORY_BREAKER_OPEN, ERROR_CATEGORY_CONNECT_ERROR, ERROR_CATEGORY_INTERNAL_ERROR,
    ERROR_CATEGORY_NETWORK_ERROR, ERROR_CATEGORY_TIMEOUT,
};
use crate::core::logging::current_request_id;
use crate::core::metrics::MetricsCollector;

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// A buffered upstream answer.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub provider: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

/// Create HTTP client with connection pooling
pub fn create_http_client(config: &AppConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.server.request_timeout)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .build()?)
}

/// Sends requests to configured providers.
pub struct UpstreamClient {
    http: reqwest::Client,
    providers: Vec<ProviderConfig>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl UpstreamClient {
    pub fn new(
        http: reqwest::Client,
        providers: Vec<ProviderConfig>,
        breakers: Arc<CircuitBreakerRegistry>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            http,
            providers,
            breakers,
            metrics,
        }
    }

    /// Providers serving `model`, in configuration order.
    pub fn candidates(&self, model: &str) -> Vec<&ProviderConfig> {
        self.providers.iter().filter(|p| p.serves(model)).collect()
    }

    /// POST `body` to `path` on the first provider for `model` that answers.
    ///
    /// 4xx answers are returned as-is; they say nothing about provider
    /// health and are not retried elsewhere.
    pub async fn dispatch(&self, model: &str, path: &str, body: Bytes) -> Result<UpstreamResponse> {
        let candidates = self.candidates(model);
        if candidates.is_empty() {
            return Err(AppError::BadRequest(format!(
                "No provider available for model '{}'",
                model
            )));
        }

        let mut last_error = None;
        for provider in candidates {
            match self.send(provider, model, path, body.clone()).await {
                Ok(response) => return Ok(response),
                Err(e) if is_failover_error(&e) => {
                    tracing::warn!(
                        request_id = %current_request_id(),
                        provider = %provider.name,
                        model = %model,
                        error = %e,
                        "Upstream unavailable, trying next provider"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| AppError::Internal("no provider attempted".to_string())))
    }

    /// Single attempt against `provider` through its breaker.
    pub async fn send(
        &self,
        provider: &ProviderConfig,
        model: &str,
        path: &str,
        body: Bytes,
    ) -> Result<UpstreamResponse> {
        let url = format!(
            "{}/{}",
            provider.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let start = Instant::now();

        let result = self
            .breakers
            .execute(&provider.name, || self.post(provider, &url, body))
            .await;

        let elapsed = start.elapsed();
        if let Some(metrics) = &self.metrics {
            match &result {
                Ok(response) => {
                    metrics.record_upstream_request(&provider.name, model, response.status, elapsed)
                }
                Err(BreakerError::Inner(AppError::Upstream { status, .. })) => {
                    metrics.record_upstream_request(&provider.name, model, *status, elapsed)
                }
                Err(BreakerError::Inner(e)) => {
                    let category = error_category(e);
                    metrics.record_upstream_failure(&provider.name, model, category, elapsed);
                    metrics.record_error(category, &provider.name);
                }
                Err(BreakerError::Open { .. }) => {
                    metrics.record_upstream_failure(
                        &provider.name,
                        model,
                        ERROR_CATEGORY_BREAKER_OPEN,
                        elapsed,
                    );
                }
            }
        }

        result.map_err(AppError::from)
    }

    async fn post(&self, provider: &ProviderConfig, url: &str, body: Bytes) -> Result<UpstreamResponse> {
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if !provider.api_key.is_empty() {
            request = request.bearer_auth(&provider.api_key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;

        if status >= 500 {
            return Err(AppError::Upstream {
                status,
                message: extract_error_message(&body),
            });
        }

        Ok(UpstreamResponse {
            provider: provider.name.clone(),
            status,
            content_type,
            body,
        })
    }
}

fn is_failover_error(error: &AppError) -> bool {
    matches!(error, AppError::BreakerOpen { .. }) || error.counts_as_failure()
}

/// Metrics category for an error that produced no upstream status.
fn error_category(error: &AppError) -> &'static str {
    match error {
        AppError::Timeout => ERROR_CATEGORY_TIMEOUT,
        AppError::Request(e) if e.is_timeout() => ERROR_CATEGORY_TIMEOUT,
        AppError::Request(e) if e.is_connect() => ERROR_CATEGORY_CONNECT_ERROR,
        AppError::Request(_) => ERROR_CATEGORY_NETWORK_ERROR,
        _ => ERROR_CATEGORY_INTERNAL_ERROR,
    }
}

/// Best-effort error message from a provider error body.
fn extract_error_message(body: &[u8]) -> String {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|body| {
        body.get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
            .or_else(|| body.get("error").and_then(|e| e.as_str()))
            .or_else(|| body.get("message").and_then(|m| m.as_str()))
            .map(str::to_string)
    });

    match message {
        Some(message) => truncate_message(&message),
        None if body.is_empty() => "empty response".to_string(),
        None => truncate_message(&String::from_utf8_lossy(body)),
    }
}

fn truncate_message(message: &str) -> String {
    let mut chars = message.chars();
    let truncated: String = chars.by_ref().take(MAX_ERROR_MESSAGE_LEN).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}
