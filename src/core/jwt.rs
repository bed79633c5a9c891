//! Bearer JWT verification.
//!
//! Verification is HS256 against a shared secret with zero leeway. Revoked
//! token ids live in a sharded denylist until their own expiry, after which
//! [`JwtAuthenticator::purge_expired`] drops them; lookups never wait on a
//! purge in progress for a different shard.

use axum::http::HeaderMap;
use dashmap::DashMap;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, get_current_timestamp, Algorithm, DecodingKey,
    EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use crate::api::auth::extract_bearer;
use crate::core::config::JwtConfig;

/// Registered claims plus whatever else the issuer put in the token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Authenticated caller attached to the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub subject: String,
    pub claims: Claims,
}

/// Outcome of optional authentication, stored as a request extension.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    Authenticated(Identity),
    Anonymous,
}

impl AuthResult {
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            AuthResult::Authenticated(identity) => Some(identity),
            AuthResult::Anonymous => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthResult::Anonymous)
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("token expired")]
    Expired,

    #[error("token revoked")]
    Revoked,

    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Verifies (and for operators, issues) HS256 bearer tokens.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
    /// jti -> exp
    revoked: DashMap<String, u64>,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8], issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &issuer {
            validation.set_issuer(&[issuer.as_str()]);
        }

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            issuer,
            revoked: DashMap::new(),
        }
    }

    /// `None` when no secret is configured.
    pub fn from_config(config: &JwtConfig) -> Option<Self> {
        config
            .is_enabled()
            .then(|| Self::new(config.secret.as_bytes(), config.issuer.clone()))
    }

    /// Sign a token for `subject` valid for `ttl`.
    pub fn issue(
        &self,
        subject: &str,
        ttl: Duration,
        extra: Map<String, Value>,
    ) -> Result<String, JwtError> {
        let now = get_current_timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now,
            exp: now + ttl.as_secs(),
            jti: Some(uuid::Uuid::new_v4().to_string()),
            iss: self.issuer.clone(),
            extra,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }

    /// Check signature, expiry (strictly before `exp`), issuer and revocation.
    pub fn verify(&self, token: &str) -> Result<Claims, JwtError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => JwtError::Expired,
                _ => JwtError::Invalid(e),
            }
        })?;
        let claims = data.claims;

        if claims.exp <= get_current_timestamp() {
            return Err(JwtError::Expired);
        }
        if let Some(jti) = &claims.jti {
            if self.is_revoked(jti) {
                return Err(JwtError::Revoked);
            }
        }
        Ok(claims)
    }

    /// Annotate-only authentication: any missing or bad token is anonymous.
    pub fn authenticate(&self, headers: &HeaderMap) -> AuthResult {
        let Some(token) = extract_bearer(headers) else {
            return AuthResult::Anonymous;
        };

        match self.verify(token) {
            Ok(claims) => AuthResult::Authenticated(Identity {
                subject: claims.sub.clone(),
                claims,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Bearer token rejected, continuing as anonymous");
                AuthResult::Anonymous
            }
        }
    }

    /// Deny `jti` until `exp` (unix seconds).
    pub fn revoke(&self, jti: &str, exp: u64) {
        self.revoked.insert(jti.to_string(), exp);
    }

    pub fn is_revoked(&self, jti: &str) -> bool {
        self.revoked.contains_key(jti)
    }

    /// Drop denylist entries whose token has expired anyway.
    pub fn purge_expired(&self) -> usize {
        let now = get_current_timestamp();
        let before = self.revoked.len();
        self.revoked.retain(|_, exp| *exp > now);
        let purged = before.saturating_sub(self.revoked.len());
        if purged > 0 {
            tracing::debug!(purged, remaining = self.revoked.len(), "Purged expired revocations");
        }
        purged
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}
