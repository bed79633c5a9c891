//! Shared constants for structured API errors and runtime error semantics.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_OVERLOADED: &str = "overloaded_error";

pub const ERROR_CODE_RATE_LIMITED: &str = "rate_limited";
pub const ERROR_CODE_BREAKER_OPEN: &str = "breaker_open";
pub const ERROR_CODE_UNAUTHORIZED: &str = "unauthorized";
pub const ERROR_CODE_UPSTREAM: &str = "upstream_error";
pub const ERROR_CODE_INTERNAL: &str = "internal_error";

pub const ERROR_CATEGORY_TIMEOUT: &str = "timeout";
pub const ERROR_CATEGORY_CONNECT_ERROR: &str = "connect_error";
pub const ERROR_CATEGORY_NETWORK_ERROR: &str = "network_error";
pub const ERROR_CATEGORY_BREAKER_OPEN: &str = "breaker_open";
pub const ERROR_CATEGORY_INTERNAL_ERROR: &str = "internal_error";

/// Why a request failed structural validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationErrorKind {
    BodyTooLarge,
    HeadersTooLarge,
    QueryTooLong,
    PathTraversal,
}

impl ValidationErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BodyTooLarge => "body_too_large",
            Self::HeadersTooLarge => "headers_too_large",
            Self::QueryTooLong => "query_too_long",
            Self::PathTraversal => "path_traversal",
        }
    }

    pub const fn message(self) -> &'static str {
        match self {
            Self::BodyTooLarge => "Request body exceeds the maximum allowed size",
            Self::HeadersTooLarge => "Request headers exceed the maximum allowed size",
            Self::QueryTooLong => "Query string exceeds the maximum allowed length",
            Self::PathTraversal => "Request path contains a traversal sequence",
        }
    }
}

impl fmt::Display for ValidationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
