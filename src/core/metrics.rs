//! Prometheus metrics for the gateway.
//!
//! Each [`MetricsCollector`] owns its own registry, so several gateways (or
//! tests) can live in one process without clashing over global state. The
//! collector is shared as `Arc<MetricsCollector>` and every recording call is
//! a lock-free atomic update on the relevant family.

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;

use crate::core::circuit_breaker::CircuitState;
use crate::core::config::MetricsConfig;
use crate::core::error::{AppError, Result};
use crate::core::logging::current_request_id;

const NAMESPACE: &str = "cliproxy";

const REQUEST_BUCKETS: &[f64] = &[0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0];
const UPSTREAM_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Container for all gateway metrics.
pub struct MetricsCollector {
    registry: Registry,
    slow_request_threshold: Duration,

    /// Requests by method, normalized path and status
    http_requests: IntCounterVec,
    http_duration: HistogramVec,

    /// Upstream calls by provider, model and status
    upstream_requests: IntCounterVec,
    upstream_duration: HistogramVec,
    upstream_successes: IntCounterVec,
    upstream_errors: IntCounterVec,

    cache_hits: IntCounterVec,
    cache_misses: IntCounterVec,

    /// Errors by category and provider
    errors: IntCounterVec,

    /// Requests currently being served, by endpoint
    inflight: IntGaugeVec,

    rate_limit_rejections: IntCounter,
    validation_failures: IntCounterVec,

    /// Breaker state per target (0 closed, 1 open, 2 half-open)
    breaker_state: IntGaugeVec,
    breaker_transitions: IntCounterVec,
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn histogram_opts(name: &str, help: &str, buckets: &[f64]) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(buckets.to_vec())
}

impl MetricsCollector {
    /// Create a collector and register every family on a fresh registry.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        Self::build(config.slow_request_threshold).map_err(|e| {
            AppError::Internal(format!("Failed to register metrics: {}", e))
        })
    }

    fn build(slow_request_threshold: Duration) -> prometheus::Result<Self> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            opts("http_requests_total", "Total number of HTTP requests"),
            &["method", "path", "status"],
        )?;
        let http_duration = HistogramVec::new(
            histogram_opts(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                REQUEST_BUCKETS,
            ),
            &["method", "path"],
        )?;
        let upstream_requests = IntCounterVec::new(
            opts("upstream_requests_total", "Total number of upstream requests"),
            &["provider", "model", "status"],
        )?;
        let upstream_duration = HistogramVec::new(
            histogram_opts(
                "upstream_request_duration_seconds",
                "Upstream request duration in seconds",
                UPSTREAM_BUCKETS,
            ),
            &["provider", "model"],
        )?;
        let upstream_successes = IntCounterVec::new(
            opts("upstream_successes_total", "Upstream requests answered with 2xx"),
            &["provider", "model"],
        )?;
        let upstream_errors = IntCounterVec::new(
            opts("upstream_errors_total", "Failed upstream requests by error type"),
            &["provider", "error_type"],
        )?;
        let cache_hits = IntCounterVec::new(
            opts("cache_hits_total", "Cache hits"),
            &["cache_type", "provider"],
        )?;
        let cache_misses = IntCounterVec::new(
            opts("cache_misses_total", "Cache misses"),
            &["cache_type", "provider"],
        )?;
        let errors = IntCounterVec::new(
            opts("errors_total", "Errors by category"),
            &["error_type", "provider"],
        )?;
        let inflight = IntGaugeVec::new(
            opts("inflight_requests", "Requests currently being served"),
            &["endpoint"],
        )?;
        let rate_limit_rejections = IntCounter::with_opts(opts(
            "rate_limit_rejections_total",
            "Requests rejected by the rate limiter",
        ))?;
        let validation_failures = IntCounterVec::new(
            opts("validation_failures_total", "Requests rejected by validation"),
            &["kind"],
        )?;
        let breaker_state = IntGaugeVec::new(
            opts(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["target"],
        )?;
        let breaker_transitions = IntCounterVec::new(
            opts("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["target", "to"],
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(upstream_requests.clone()))?;
        registry.register(Box::new(upstream_duration.clone()))?;
        registry.register(Box::new(upstream_successes.clone()))?;
        registry.register(Box::new(upstream_errors.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(inflight.clone()))?;
        registry.register(Box::new(rate_limit_rejections.clone()))?;
        registry.register(Box::new(validation_failures.clone()))?;
        registry.register(Box::new(breaker_state.clone()))?;
        registry.register(Box::new(breaker_transitions.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            slow_request_threshold,
            http_requests,
            http_duration,
            upstream_requests,
            upstream_duration,
            upstream_successes,
            upstream_errors,
            cache_hits,
            cache_misses,
            errors,
            inflight,
            rate_limit_rejections,
            validation_failures,
            breaker_state,
            breaker_transitions,
        })
    }

    /// Record one completed inbound request.
    ///
    /// Requests slower than the configured threshold also emit a warning
    /// carrying the request id.
    pub fn record_request(&self, method: &str, path: &str, status: u16, duration: Duration) {
        let path = normalize_path(path);
        self.http_requests
            .with_label_values(&[method, &path, &status.to_string()])
            .inc();
        self.http_duration
            .with_label_values(&[method, &path])
            .observe(duration.as_secs_f64());

        if !self.slow_request_threshold.is_zero() && duration > self.slow_request_threshold {
            tracing::warn!(
                request_id = %current_request_id(),
                method = %method,
                path = %path,
                status = status,
                duration_ms = duration.as_millis() as u64,
                threshold_ms = self.slow_request_threshold.as_millis() as u64,
                "Slow request"
            );
        }
    }

    /// Record one upstream call that produced an HTTP status.
    ///
    /// 2xx counts as success; anything else is an error of type `http_<code>`.
    pub fn record_upstream_request(
        &self,
        provider: &str,
        model: &str,
        status: u16,
        duration: Duration,
    ) {
        self.upstream_requests
            .with_label_values(&[provider, model, &status.to_string()])
            .inc();
        self.upstream_duration
            .with_label_values(&[provider, model])
            .observe(duration.as_secs_f64());

        if (200..300).contains(&status) {
            self.upstream_successes
                .with_label_values(&[provider, model])
                .inc();
        } else {
            self.upstream_errors
                .with_label_values(&[provider, &format!("http_{}", status)])
                .inc();
        }
    }

    /// Record an upstream call that never produced a status (timeout,
    /// connection failure, open breaker).
    pub fn record_upstream_failure(
        &self,
        provider: &str,
        model: &str,
        error_type: &str,
        duration: Duration,
    ) {
        self.upstream_requests
            .with_label_values(&[provider, model, "error"])
            .inc();
        self.upstream_duration
            .with_label_values(&[provider, model])
            .observe(duration.as_secs_f64());
        self.upstream_errors
            .with_label_values(&[provider, error_type])
            .inc();
    }

    pub fn record_cache_hit(&self, cache_type: &str, provider: &str) {
        self.cache_hits
            .with_label_values(&[cache_type, provider])
            .inc();
    }

    pub fn record_cache_miss(&self, cache_type: &str, provider: &str) {
        self.cache_misses
            .with_label_values(&[cache_type, provider])
            .inc();
    }

    pub fn record_error(&self, error_type: &str, provider: &str) {
        self.errors
            .with_label_values(&[error_type, provider])
            .inc();
    }

    pub fn record_rate_limited(&self) {
        self.rate_limit_rejections.inc();
    }

    pub fn record_validation_failure(&self, kind: &str) {
        self.validation_failures.with_label_values(&[kind]).inc();
    }

    pub fn increment_inflight(&self, endpoint: &str) {
        self.inflight.with_label_values(&[endpoint]).inc();
    }

    pub fn decrement_inflight(&self, endpoint: &str) {
        self.inflight.with_label_values(&[endpoint]).dec();
    }

    /// Increment inflight for `endpoint` until the returned guard drops.
    pub fn track_inflight(self: &Arc<Self>, endpoint: &str) -> InflightGuard {
        self.increment_inflight(endpoint);
        InflightGuard {
            metrics: self.clone(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn set_breaker_state(&self, target: &str, state: CircuitState) {
        self.breaker_state
            .with_label_values(&[target])
            .set(state.as_gauge());
    }

    pub fn record_breaker_transition(&self, target: &str, to: CircuitState) {
        self.set_breaker_state(target, to);
        self.breaker_transitions
            .with_label_values(&[target, to.as_str()])
            .inc();
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn scrape(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| AppError::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| AppError::Internal(format!("Metrics are not valid UTF-8: {}", e)))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn request_count(&self, method: &str, path: &str, status: u16) -> u64 {
        self.http_requests
            .with_label_values(&[method, &normalize_path(path), &status.to_string()])
            .get()
    }

    pub fn upstream_success_count(&self, provider: &str, model: &str) -> u64 {
        self.upstream_successes
            .with_label_values(&[provider, model])
            .get()
    }

    pub fn upstream_error_count(&self, provider: &str, error_type: &str) -> u64 {
        self.upstream_errors
            .with_label_values(&[provider, error_type])
            .get()
    }

    pub fn inflight(&self, endpoint: &str) -> i64 {
        self.inflight.with_label_values(&[endpoint]).get()
    }

    pub fn rate_limit_rejection_count(&self) -> u64 {
        self.rate_limit_rejections.get()
    }

    pub fn validation_failure_count(&self, kind: &str) -> u64 {
        self.validation_failures.with_label_values(&[kind]).get()
    }

    pub fn breaker_state_value(&self, target: &str) -> i64 {
        self.breaker_state.with_label_values(&[target]).get()
    }
}

/// Decrements the inflight gauge on drop, including on early return or
/// cancellation.
pub struct InflightGuard {
    metrics: Arc<MetricsCollector>,
    endpoint: String,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.decrement_inflight(&self.endpoint);
    }
}

/// Collapse high-cardinality path segments (numeric ids, UUIDs, long hex
/// tokens) into `:id`.
pub fn normalize_path(path: &str) -> String {
    if !path.split('/').any(is_id_segment) {
        return path.to_string();
    }
    path.split('/')
        .map(|segment| if is_id_segment(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_id_segment(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    if segment.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    if uuid::Uuid::parse_str(segment).is_ok() {
        return true;
    }
    segment.len() >= 16
        && segment.bytes().all(|b| b.is_ascii_hexdigit())
        && segment.bytes().any(|b| b.is_ascii_digit())
}
