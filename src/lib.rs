//! CLIProxy Gateway - the request pipeline of an LLM API proxy
//!
//! Every inbound request passes through a fixed chain of independently
//! configurable components before reaching a handler:
//!
//! - **Request ID**: echoes or generates `X-Request-ID` and scopes it for logs
//! - **Validation**: body, header, query and path-traversal checks
//! - **Rate Limiting**: per API key or client IP token buckets
//! - **Metrics**: Prometheus request counters, latency and inflight gauges
//! - **JWT**: optional bearer-token annotation, with a separate required mode
//!
//! Outbound calls to providers go through per-upstream circuit breakers.
//!
//! # Architecture
//!
//! - [`core`]: the components themselves (config, errors, limiter, breakers, metrics, JWT, middleware)
//! - [`api`]: HTTP handlers and the route table
//! - [`services`]: pipeline assembly and upstream dispatch
//!
//! # Configuration
//!
//! Loaded from the YAML file at `CONFIG_PATH` (default `config.yaml`).
//!
//! Optional environment variables:
//! - `HOST`: Server bind address (default: 0.0.0.0)
//! - `PORT`: Server port (default: 8317)
//! - `JWT_SECRET`: enables optional JWT authentication
//! - `METRICS_PATH`: scrape endpoint path (default: /metrics)
//! - `RATE_LIMIT_ENABLED`: toggles rate limiting

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppConfig, AppError, Result};
pub use services::{Components, UpstreamClient};
