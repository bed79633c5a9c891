//! Structural request validation.
//!
//! Cheap checks that run before any rate-limit budget or handler work is
//! spent: declared body size, total header bytes, raw query length and path
//! traversal. Bodies without a `Content-Length` are enforced while streaming
//! by the validation middleware using [`RequestValidator::read_limited`].

use axum::body::{Body, Bytes};
use axum::http::{header, request::Parts};

use crate::core::config::ValidationConfig;
use crate::core::error_types::ValidationErrorKind;

/// Immutable size ceilings. A zero limit disables that check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub max_body_size: u64,
    pub max_header_size: u64,
    pub max_query_length: usize,
}

impl From<&ValidationConfig> for ValidationPolicy {
    fn from(config: &ValidationConfig) -> Self {
        Self {
            max_body_size: config.max_body_size,
            max_header_size: config.max_header_size,
            max_query_length: config.max_query_length,
        }
    }
}

/// Validates request metadata against a [`ValidationPolicy`].
#[derive(Debug, Clone)]
pub struct RequestValidator {
    policy: ValidationPolicy,
}

impl RequestValidator {
    pub fn new(policy: ValidationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Run every metadata check in order; the first failure wins.
    pub fn validate_parts(&self, parts: &Parts) -> Result<(), ValidationErrorKind> {
        if let Some(length) = declared_content_length(parts) {
            self.check_body_size(length)?;
        }
        self.check_headers(parts)?;
        self.check_query(parts.uri.query().unwrap_or(""))?;
        check_path(parts.uri.path())
    }

    pub fn check_body_size(&self, length: u64) -> Result<(), ValidationErrorKind> {
        if self.policy.max_body_size > 0 && length > self.policy.max_body_size {
            return Err(ValidationErrorKind::BodyTooLarge);
        }
        Ok(())
    }

    fn check_headers(&self, parts: &Parts) -> Result<(), ValidationErrorKind> {
        if self.policy.max_header_size == 0 {
            return Ok(());
        }
        let total: u64 = parts
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().len() + value.len()) as u64)
            .sum();
        if total > self.policy.max_header_size {
            return Err(ValidationErrorKind::HeadersTooLarge);
        }
        Ok(())
    }

    fn check_query(&self, query: &str) -> Result<(), ValidationErrorKind> {
        if self.policy.max_query_length > 0 && query.len() > self.policy.max_query_length {
            return Err(ValidationErrorKind::QueryTooLong);
        }
        Ok(())
    }

    /// Whether the body must be read through a limit because its size is
    /// not declared up front.
    pub fn needs_streaming_check(&self, parts: &Parts) -> bool {
        self.policy.max_body_size > 0 && declared_content_length(parts).is_none()
    }

    /// Buffer at most `max_body_size` bytes of `body`, failing as soon as
    /// the limit is crossed.
    pub async fn read_limited(&self, body: Body) -> Result<Bytes, ValidationErrorKind> {
        let limit = usize::try_from(self.policy.max_body_size).unwrap_or(usize::MAX);
        axum::body::to_bytes(body, limit)
            .await
            .map_err(|_| ValidationErrorKind::BodyTooLarge)
    }
}

fn declared_content_length(parts: &Parts) -> Option<u64> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Reject `..` segments in any spelling: literal, backslash separated,
/// percent-encoded, or double percent-encoded. NUL bytes are rejected too.
pub fn check_path(path: &str) -> Result<(), ValidationErrorKind> {
    let mut candidate = path.to_string();

    // Decode up to three times to unwrap %252e-style double encoding
    for _ in 0..3 {
        if contains_traversal(&candidate) {
            return Err(ValidationErrorKind::PathTraversal);
        }
        let decoded = percent_decode(&candidate);
        if decoded == candidate {
            break;
        }
        candidate = decoded;
    }

    if contains_traversal(&candidate) {
        return Err(ValidationErrorKind::PathTraversal);
    }
    Ok(())
}

fn contains_traversal(path: &str) -> bool {
    if path.contains('\0') {
        return true;
    }
    path.split(['/', '\\']).any(|segment| segment == "..")
}

fn percent_decode(input: &str) -> String {
    String::from_utf8_lossy(&urlencoding::decode_binary(input.as_bytes())).into_owned()
}
