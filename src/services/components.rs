//! Assembly of the request pipeline.
//!
//! [`Components`] owns every stateful pipeline component, layers them onto
//! a router in a fixed order and runs their maintenance loops until
//! [`Components::shutdown`].

use axum::{extract::DefaultBodyLimit, middleware, Router};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::catch_panic::CatchPanicLayer;

use crate::core::circuit_breaker::CircuitBreakerRegistry;
use crate::core::config::AppConfig;
use crate::core::error::Result;
use crate::core::jwt::JwtAuthenticator;
use crate::core::metrics::MetricsCollector;
use crate::core::middleware::{
    handle_panic, optional_auth_middleware, rate_limit_middleware, request_id_middleware,
    require_auth_middleware, validation_middleware, MetricsMiddleware, RateLimitState,
    ValidationState,
};
use crate::core::rate_limiter::RateLimiter;
use crate::core::shutdown::ShutdownHandle;
use crate::core::validator::{RequestValidator, ValidationPolicy};

/// How often fully refilled rate-limit buckets are dropped
const RATE_LIMIT_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Every pipeline component, each present only when enabled.
pub struct Components {
    config: AppConfig,
    pub metrics: Option<Arc<MetricsCollector>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub validator: Arc<RequestValidator>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub jwt: Option<Arc<JwtAuthenticator>>,
    shutdown: ShutdownHandle,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Components {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let metrics = if config.metrics.enabled {
            Some(Arc::new(MetricsCollector::new(&config.metrics)?))
        } else {
            None
        };

        let rate_limiter = config
            .rate_limit
            .enabled
            .then(|| Arc::new(RateLimiter::new(&config.rate_limit)));

        let validator = Arc::new(RequestValidator::new(ValidationPolicy::from(
            &config.validation,
        )));

        let mut breakers = CircuitBreakerRegistry::new(&config.circuit_breaker);
        if let Some(metrics) = &metrics {
            breakers = breakers.with_metrics(metrics.clone());
        }

        let jwt = JwtAuthenticator::from_config(&config.jwt).map(Arc::new);

        tracing::info!(
            metrics = metrics.is_some(),
            rate_limit = rate_limiter.is_some(),
            circuit_breaker = breakers.is_enabled(),
            jwt = jwt.is_some(),
            "Pipeline components initialized"
        );

        Ok(Self {
            config: config.clone(),
            metrics,
            rate_limiter,
            validator,
            breakers: Arc::new(breakers),
            jwt,
            shutdown: ShutdownHandle::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Layer the pipeline onto every route currently in `router`.
    ///
    /// Outermost first: request id, panic recovery, validation, rate
    /// limiting, metrics, panic recovery again, optional JWT annotation,
    /// then the handler. The inner recovery lets a panicking handler still
    /// be recorded by the metrics stage. `Router::layer` wraps outward, so
    /// layers are added innermost first.
    ///
    /// Axum's default 2 MiB body cap is lifted; the validation stage
    /// enforces `validation.max-body-size` instead.
    pub fn apply<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let mut router = router;

        if let Some(jwt) = &self.jwt {
            router = router.layer(middleware::from_fn_with_state(
                jwt.clone(),
                optional_auth_middleware,
            ));
        }

        router = router.layer(CatchPanicLayer::custom(handle_panic));

        if let Some(metrics) = &self.metrics {
            let state = MetricsMiddleware {
                metrics: metrics.clone(),
                scrape_path: self.config.metrics.path.clone(),
            };
            router = router.layer(middleware::from_fn_with_state(
                state,
                MetricsMiddleware::track_metrics,
            ));
        }

        if let Some(limiter) = &self.rate_limiter {
            let state = RateLimitState {
                limiter: limiter.clone(),
                metrics: self.metrics.clone(),
            };
            router = router.layer(middleware::from_fn_with_state(state, rate_limit_middleware));
        }

        let state = ValidationState {
            validator: self.validator.clone(),
            metrics: self.metrics.clone(),
        };
        router
            .layer(middleware::from_fn_with_state(state, validation_middleware))
            .layer(CatchPanicLayer::custom(handle_panic))
            .layer(middleware::from_fn(request_id_middleware))
            .layer(DefaultBodyLimit::disable())
    }

    /// Reject anonymous callers on `router`. A no-op without a JWT secret.
    pub fn require_auth<S>(&self, router: Router<S>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        match &self.jwt {
            Some(jwt) => router.layer(middleware::from_fn_with_state(
                jwt.clone(),
                require_auth_middleware,
            )),
            None => router,
        }
    }

    /// Spawn the maintenance loops. Calling it again is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(jwt) = &self.jwt {
            let jwt = jwt.clone();
            self.spawn_loop("jwt-revocation-purge", self.config.jwt.cleanup_interval, move || {
                jwt.purge_expired();
            });
        }

        if self.breakers.is_enabled() {
            let breakers = self.breakers.clone();
            self.spawn_loop(
                "circuit-breaker-sweep",
                self.config.circuit_breaker.health_check_interval,
                move || {
                    let promoted = breakers.sweep();
                    if promoted > 0 {
                        tracing::debug!(promoted, "Breaker sweep promoted expired breakers");
                    }
                },
            );
        }

        if let Some(limiter) = &self.rate_limiter {
            let limiter = limiter.clone();
            self.spawn_loop(
                "rate-limit-eviction",
                RATE_LIMIT_EVICTION_INTERVAL,
                move || {
                    let evicted = limiter.evict_idle();
                    if evicted > 0 {
                        tracing::debug!(evicted, remaining = limiter.tracked_keys(), "Evicted idle rate-limit buckets");
                    }
                },
            );
        }
    }

    fn spawn_loop<F>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if period.is_zero() {
            tracing::debug!(task = name, "Maintenance loop disabled by zero interval");
            return;
        }

        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => tick(),
                }
            }
            tracing::debug!(task = name, "Maintenance loop stopped");
        });

        tracing::debug!(task = name, period_ms = period.as_millis() as u64, "Maintenance loop started");
        self.tasks.lock().push(handle);
    }

    /// Number of running maintenance loops.
    pub fn running_tasks(&self) -> usize {
        self.tasks.lock().iter().filter(|h| !h.is_finished()).count()
    }

    /// Signal every loop to stop and wait for them. In-flight requests are
    /// not touched.
    pub async fn shutdown(&self) {
        self.shutdown.trigger();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Maintenance loop ended abnormally");
            }
        }
        tracing::info!("Pipeline maintenance stopped");
    }
}
