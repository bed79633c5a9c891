//! Shared credential extraction.
//!
//! Supports both OpenAI-style (`Authorization: Bearer`) and Claude-style
//! (`x-api-key`) headers. The raw key is never stored or logged; callers
//! that need an identity use [`hash_key`].

use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

// ============================================================================
// Helper Functions
// ============================================================================

/// Hash an API key using SHA-256.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the client API key; `x-api-key` takes priority over Bearer.
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| extract_bearer(headers))
}

/// Extract Bearer token from Authorization header.
pub fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer ").or_else(|| s.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ============================================================================
// Tests
// ============================================================================
