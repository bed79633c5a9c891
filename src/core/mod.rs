//! Core functionality for the gateway.
//!
//! This module contains the stateful pipeline components and the ambient
//! pieces they share:
//! - Configuration management
//! - Error handling and logging
//! - Rate limiting, validation, circuit breaking, metrics and JWT
//! - HTTP middleware

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod error_types;
pub mod jwt;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod rate_limiter;
pub mod shutdown;
pub mod validator;

// Re-export commonly used types
pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreakerRegistry, CircuitState, FailureClassifier,
};
pub use config::{AppConfig, ProviderConfig, ServerConfig};
pub use error::{AppError, Result};
pub use jwt::{AuthResult, Claims, Identity, JwtAuthenticator};
pub use logging::{current_request_id, init_logging, REQUEST_ID};
pub use metrics::MetricsCollector;
pub use middleware::{
    optional_auth_middleware, request_id_middleware, require_auth_middleware, MetricsMiddleware,
};
pub use rate_limiter::{RateLimitDecision, RateLimiter};
pub use shutdown::ShutdownHandle;
pub use validator::{RequestValidator, ValidationPolicy};
