//! Configuration management for the gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion. Keys are kebab-case
//! (`rate-limit.requests-per-minute`, `circuit-breaker.timeout`, ...).

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Token-bucket admission control
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Request size and path ceilings
    #[serde(default)]
    pub validation: ValidationConfig,

    /// Per-upstream circuit breakers
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Prometheus metrics
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Optional JWT annotation
    #[serde(default)]
    pub jwt: JwtConfig,

    /// Upstream providers the passthrough handler dispatches to
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Timeout applied to upstream requests
    #[serde(default = "default_request_timeout", with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Sustained rate; refill is `requests_per_minute / 60` tokens per second
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Bucket capacity (allows temporary spikes)
    #[serde(default = "default_burst")]
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
        }
    }
}

/// Request validation ceilings. A zero value disables that check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ValidationConfig {
    #[serde(default = "default_max_body_size")]
    pub max_body_size: u64,

    #[serde(default = "default_max_header_size")]
    pub max_header_size: u64,

    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_body_size: default_max_body_size(),
            max_header_size: default_max_header_size(),
            max_query_length: default_max_query_length(),
        }
    }
}

/// Circuit breaker configuration shared by every upstream target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Consecutive failures that trip a closed breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Consecutive half-open successes that close the breaker
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// How long a breaker stays open before admitting trial calls
    #[serde(default = "default_breaker_timeout", with = "duration_str")]
    pub timeout: Duration,

    /// Concurrent trial calls allowed while half-open
    #[serde(default = "default_half_open_max_requests")]
    pub half_open_max_requests: u32,

    /// Interval of the background sweep over open breakers
    #[serde(default = "default_health_check_interval", with = "duration_str")]
    pub health_check_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout: default_breaker_timeout(),
            half_open_max_requests: default_half_open_max_requests(),
            health_check_interval: default_health_check_interval(),
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetricsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Path of the scrape endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,

    /// Requests slower than this emit a warning event
    #[serde(default = "default_slow_request_threshold", with = "duration_str")]
    pub slow_request_threshold: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            path: default_metrics_path(),
            slow_request_threshold: default_slow_request_threshold(),
        }
    }
}

/// JWT configuration. An empty secret disables optional authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JwtConfig {
    #[serde(default)]
    pub secret: String,

    /// Expected `iss` claim, if any
    #[serde(default)]
    pub issuer: Option<String>,

    /// Interval of the revocation list purge
    #[serde(default = "default_jwt_cleanup_interval", with = "duration_str")]
    pub cleanup_interval: Duration,

    /// Reject anonymous callers on the proxy routes
    #[serde(default)]
    pub require: bool,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: None,
            cleanup_interval: default_jwt_cleanup_interval(),
            require: false,
        }
    }
}

impl JwtConfig {
    pub fn is_enabled(&self) -> bool {
        !self.secret.is_empty()
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProviderConfig {
    /// Provider name (breaker target and metrics label)
    pub name: String,

    /// Base URL for the provider's API
    pub api_base: String,

    /// API key sent upstream as a bearer token
    #[serde(default)]
    pub api_key: String,

    /// Models this provider serves; empty means any model
    #[serde(default)]
    pub models: Vec<String>,
}

impl ProviderConfig {
    pub fn serves(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8317
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_burst() -> u32 {
    10
}

fn default_max_body_size() -> u64 {
    10 * 1024 * 1024
}

fn default_max_header_size() -> u64 {
    64 * 1024
}

fn default_max_query_length() -> usize {
    8192
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_half_open_max_requests() -> u32 {
    1
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_slow_request_threshold() -> Duration {
    Duration::from_secs(5)
}

fn default_jwt_cleanup_interval() -> Duration {
    Duration::from_secs(300)
}

impl AppConfig {
    /// Load configuration from a YAML file.
    ///
    /// A missing file is not an error: the defaults are used and the
    /// environment overrides still apply.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use cliproxy_gateway::core::config::AppConfig;
    ///
    /// let config = AppConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_yaml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text after environment expansion.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        // An empty document deserializes to unit, not to a mapping
        if expanded.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&expanded)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }

        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.parse::<u16>() {
                self.server.port = port;
            }
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            self.jwt.secret = secret;
        }

        if let Ok(path) = std::env::var("METRICS_PATH") {
            self.metrics.path = path;
        }

        if let Ok(enabled) = std::env::var("RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = str_to_bool(&enabled);
        }
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limit.enabled {
            if self.rate_limit.requests_per_minute == 0 {
                return Err(anyhow!("rate-limit.requests-per-minute must be > 0"));
            }
            if self.rate_limit.burst == 0 {
                return Err(anyhow!("rate-limit.burst must be > 0"));
            }
        }

        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0
                || self.circuit_breaker.success_threshold == 0
            {
                return Err(anyhow!("circuit-breaker thresholds must be > 0"));
            }
            if self.circuit_breaker.half_open_max_requests == 0 {
                return Err(anyhow!("circuit-breaker.half-open-max-requests must be > 0"));
            }
        }

        if self.jwt.require && !self.jwt.is_enabled() {
            return Err(anyhow!("jwt.require needs jwt.secret to be set"));
        }

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            return Err(anyhow!(
                "metrics.path must start with '/': {}",
                self.metrics.path
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    static ENV_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\$\{([^}:]+)(?::-?([^}]*))?\}").expect("valid env regex"));

    ENV_RE
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Parse a Go-style duration string such as `500ms`, `30s`, `5m`, `1h` or `1m30s`.
///
/// A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    static PART_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(\d+(?:\.\d+)?)(ms|us|µs|ns|s|m|h)").expect("valid duration regex"));

    let input = input.trim();
    if input.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in PART_RE.captures_iter(input) {
        let whole = caps.get(0).map(|m| m.as_str()).unwrap_or("");
        consumed += whole.len();

        let value: f64 = caps[1]
            .parse()
            .with_context(|| format!("invalid number in duration: {}", input))?;
        let unit_secs = match &caps[2] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            _ => 1e-9,
        };
        let part = Duration::try_from_secs_f64(value * unit_secs)
            .map_err(|_| anyhow!("duration out of range: {}", input))?;
        total = total
            .checked_add(part)
            .ok_or_else(|| anyhow!("duration out of range: {}", input))?;
    }

    if consumed != input.len() {
        return Err(anyhow!("invalid duration: {}", input));
    }
    Ok(total)
}

/// Format a duration in the same notation [`parse_duration`] accepts.
pub fn format_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        format!("{}ms", millis)
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use super::*;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
