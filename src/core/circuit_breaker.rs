//! Per-upstream circuit breakers.
//!
//! One breaker per target name, created on first reference. Each breaker
//! serializes its transitions behind its own short-held lock; the registry
//! map is sharded so different targets never contend. Open timeouts are
//! evaluated lazily on access by wall-clock comparison, plus an optional
//! periodic [`CircuitBreakerRegistry::sweep`].
//!
//! State machine:
//!
//! ```text
//!            failures >= failure_threshold
//!   Closed ─────────────────────────────────▶ Open
//!     ▲                                        │ now - opened_at >= open_timeout
//!     │ successes >= success_threshold         ▼
//!     └──────────────────────────────────── HalfOpen ──▶ Open (any trial failure)
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;

use crate::core::config::CircuitBreakerConfig;
use crate::core::error::AppError;
use crate::core::metrics::MetricsCollector;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    pub const fn as_gauge(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thresholds shared by every breaker in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
    pub half_open_max_in_flight: u32,
}

impl From<&CircuitBreakerConfig> for BreakerSettings {
    fn from(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            open_timeout: config.timeout,
            half_open_max_in_flight: config.half_open_max_requests.max(1),
        }
    }
}

/// Decides whether an operation error means the upstream is unavailable.
///
/// Only unavailability (timeouts, 5xx, connection failures) trips a
/// breaker; client-side and validation errors pass through uncounted.
pub trait FailureClassifier {
    fn counts_as_failure(&self) -> bool;
}

impl FailureClassifier for reqwest::Error {
    fn counts_as_failure(&self) -> bool {
        if self.is_timeout() || self.is_connect() || self.is_request() {
            return true;
        }
        match self.status() {
            Some(status) => status.is_server_error(),
            // Transport failures mid-body
            None => !self.is_builder() && !self.is_decode(),
        }
    }
}

impl FailureClassifier for StatusCode {
    fn counts_as_failure(&self) -> bool {
        self.is_server_error()
    }
}

impl FailureClassifier for AppError {
    fn counts_as_failure(&self) -> bool {
        match self {
            AppError::Request(e) => e.counts_as_failure(),
            AppError::Upstream { status, .. } => *status >= 500,
            AppError::Timeout => true,
            _ => false,
        }
    }
}

/// Error returned by [`CircuitBreakerRegistry::execute`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Rejected without invoking the operation.
    Open {
        target: String,
        retry_after: Option<Duration>,
    },
    /// The operation ran and failed.
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl<E: fmt::Display> fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerError::Open { target, .. } => write!(f, "circuit breaker open for '{}'", target),
            BreakerError::Inner(e) => e.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BreakerError::Open { .. } => None,
            BreakerError::Inner(e) => Some(e),
        }
    }
}

impl From<BreakerError<AppError>> for AppError {
    fn from(err: BreakerError<AppError>) -> Self {
        match err {
            BreakerError::Open {
                target,
                retry_after,
            } => AppError::BreakerOpen {
                target,
                retry_after,
            },
            BreakerError::Inner(e) => e,
        }
    }
}

/// Point-in-time view of one breaker for health reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub in_flight: u32,
    /// How long the breaker has been open, while open
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_ms: Option<u64>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout_ms: u64,
    pub half_open_max_in_flight: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    /// Finished without a verdict (non-counting error or cancellation)
    Ignored,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    in_flight: u32,
    /// Bumped on every transition so outcomes from an earlier epoch are dropped
    generation: u64,
}

struct Transition {
    from: CircuitState,
    to: CircuitState,
    reason: &'static str,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            in_flight: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, reason: &'static str) -> Transition {
        let from = self.state;
        self.state = to;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.in_flight = 0;
        self.generation += 1;
        self.opened_at = (to == CircuitState::Open).then(Instant::now);
        Transition { from, to, reason }
    }

    /// Open -> HalfOpen once the timeout has elapsed.
    fn promote_if_expired(&mut self, open_timeout: Duration) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let expired = self
            .opened_at
            .map(|at| at.elapsed() >= open_timeout)
            .unwrap_or(true);
        expired.then(|| self.transition(CircuitState::HalfOpen, "open timeout elapsed"))
    }
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    trial: bool,
}

/// Circuit breaker for a single upstream target.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<BreakerInner>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        settings: BreakerSettings,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let breaker = Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner::new()),
            metrics,
        };
        if let Some(metrics) = &breaker.metrics {
            metrics.set_breaker_state(&breaker.name, CircuitState::Closed);
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying a pending Open -> HalfOpen promotion.
    pub fn state(&self) -> CircuitState {
        let (state, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.promote_if_expired(self.settings.open_timeout);
            (inner.state, transition)
        };
        self.emit(transition);
        state
    }

    /// Run `op` through the breaker.
    ///
    /// Returns immediately with [`BreakerError::Open`] when the breaker is
    /// open, or half-open with every trial slot taken.
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClassifier,
    {
        let guard = self.acquire()?;
        match op().await {
            Ok(value) => {
                guard.complete(Outcome::Success);
                Ok(value)
            }
            Err(e) => {
                let outcome = if e.counts_as_failure() {
                    Outcome::Failure
                } else {
                    Outcome::Ignored
                };
                guard.complete(outcome);
                Err(BreakerError::Inner(e))
            }
        }
    }

    fn acquire<E>(&self) -> Result<CallGuard<'_>, BreakerError<E>> {
        let (result, transition) = {
            let mut inner = self.inner.lock();
            let transition = inner.promote_if_expired(self.settings.open_timeout);

            let result = match inner.state {
                CircuitState::Closed => Ok(Permit {
                    generation: inner.generation,
                    trial: false,
                }),
                CircuitState::Open => {
                    let retry_after = inner.opened_at.map(|at| {
                        self.settings.open_timeout.saturating_sub(at.elapsed())
                    });
                    Err(retry_after)
                }
                CircuitState::HalfOpen => {
                    if inner.in_flight < self.settings.half_open_max_in_flight {
                        inner.in_flight += 1;
                        Ok(Permit {
                            generation: inner.generation,
                            trial: true,
                        })
                    } else {
                        Err(None)
                    }
                }
            };
            (result, transition)
        };
        self.emit(transition);

        match result {
            Ok(permit) => Ok(CallGuard {
                breaker: self,
                permit: Some(permit),
            }),
            Err(retry_after) => Err(BreakerError::Open {
                target: self.name.clone(),
                retry_after,
            }),
        }
    }

    fn record(&self, permit: Permit, outcome: Outcome) {
        let transition = {
            let mut inner = self.inner.lock();
            if permit.generation != inner.generation {
                // Admitted before the last transition; its slot was already reset
                return;
            }
            if permit.trial {
                inner.in_flight = inner.in_flight.saturating_sub(1);
            }

            match (inner.state, outcome) {
                (CircuitState::Closed, Outcome::Success) => {
                    inner.consecutive_failures = 0;
                    None
                }
                (CircuitState::Closed, Outcome::Failure) => {
                    inner.consecutive_failures += 1;
                    (inner.consecutive_failures >= self.settings.failure_threshold)
                        .then(|| inner.transition(CircuitState::Open, "failure threshold reached"))
                }
                (CircuitState::HalfOpen, Outcome::Success) => {
                    inner.consecutive_successes += 1;
                    (inner.consecutive_successes >= self.settings.success_threshold)
                        .then(|| inner.transition(CircuitState::Closed, "trial calls succeeded"))
                }
                (CircuitState::HalfOpen, Outcome::Failure) => {
                    Some(inner.transition(CircuitState::Open, "trial call failed"))
                }
                _ => None,
            }
        };
        self.emit(transition);
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            (inner.state != CircuitState::Closed)
                .then(|| inner.transition(CircuitState::Closed, "manual reset"))
        };
        self.emit(transition);
    }

    /// Promote an expired Open breaker; returns whether it moved.
    pub fn sweep(&self) -> bool {
        let transition = self
            .inner
            .lock()
            .promote_if_expired(self.settings.open_timeout);
        let moved = transition.is_some();
        self.emit(transition);
        moved
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            in_flight: inner.in_flight,
            open_for_ms: inner
                .opened_at
                .filter(|_| inner.state == CircuitState::Open)
                .map(|at| at.elapsed().as_millis() as u64),
            failure_threshold: self.settings.failure_threshold,
            success_threshold: self.settings.success_threshold,
            open_timeout_ms: self.settings.open_timeout.as_millis() as u64,
            half_open_max_in_flight: self.settings.half_open_max_in_flight,
        }
    }

    fn emit(&self, transition: Option<Transition>) {
        let Some(t) = transition else {
            return;
        };

        if t.to == CircuitState::Open {
            tracing::warn!(
                target_name = %self.name,
                from = %t.from,
                to = %t.to,
                reason = t.reason,
                "Circuit breaker state transition"
            );
        } else {
            tracing::info!(
                target_name = %self.name,
                from = %t.from,
                to = %t.to,
                reason = t.reason,
                "Circuit breaker state transition"
            );
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_transition(&self.name, t.to);
        }
    }
}

/// Admission held for the duration of one call. Dropping it without a
/// verdict (e.g. the caller's future was cancelled) only frees the slot.
struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Option<Permit>,
}

impl CallGuard<'_> {
    fn complete(mut self, outcome: Outcome) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, outcome);
        }
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.breaker.record(permit, Outcome::Ignored);
        }
    }
}

/// Registry of breakers keyed by upstream target name.
pub struct CircuitBreakerRegistry {
    enabled: bool,
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            settings: BreakerSettings::from(config),
            breakers: DashMap::new(),
            metrics: None,
        }
    }

    /// Export breaker state through `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn settings(&self) -> &BreakerSettings {
        &self.settings
    }

    /// Get or create the breaker for `target`.
    pub fn breaker(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return existing.clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    target,
                    self.settings,
                    self.metrics.clone(),
                ))
            })
            .clone()
    }

    /// Run `op` against `target`. A disabled registry runs it directly.
    pub async fn execute<T, E, F, Fut>(&self, target: &str, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: FailureClassifier,
    {
        if !self.enabled {
            return op().await.map_err(BreakerError::Inner);
        }
        let breaker = self.breaker(target);
        breaker.execute(op).await
    }

    /// Snapshot of one target, if it has ever been referenced.
    pub fn snapshot(&self, target: &str) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.get(target).map(|b| b.clone())?;
        breaker.state();
        Some(breaker.snapshot())
    }

    /// Snapshots of every known target, sorted by name.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        let mut snapshots: Vec<BreakerSnapshot> = breakers
            .iter()
            .map(|b| {
                b.state();
                b.snapshot()
            })
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Promote every expired Open breaker to HalfOpen. Never shortens the
    /// open timeout. Returns how many breakers moved.
    pub fn sweep(&self) -> usize {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|entry| entry.value().clone()).collect();
        breakers.iter().filter(|b| b.sweep()).count()
    }

    /// Force `target` back to Closed. Returns false for unknown targets.
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get(target).map(|b| b.clone()) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}
