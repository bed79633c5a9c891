//! API layer for the gateway.
//!
//! This module contains the HTTP handlers, credential extraction and the
//! route table.

pub mod auth;
pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::services::components::Components;
use crate::services::upstream::UpstreamClient;

// Re-export commonly used types
pub use handlers::{health_handler, metrics_handler, proxy_handler, AppState, HealthResponse};

/// Build the full router with the request pipeline applied.
pub fn build_router(components: &Components, upstream: Arc<UpstreamClient>) -> Router {
    let config = components.config();
    let state = AppState {
        upstream,
        breakers: components.breakers.clone(),
        metrics: components.metrics.clone(),
    };

    let mut proxy_routes = Router::new().route("/v1/*path", post(proxy_handler));
    if config.jwt.require {
        proxy_routes = components.require_auth(proxy_routes);
    }

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(proxy_routes);
    if config.metrics.enabled {
        router = router.route(&config.metrics.path, get(metrics_handler));
    }

    components.apply(router.with_state(state))
}
