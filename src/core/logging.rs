//! Logging setup and request correlation.
//!
//! The request-id middleware scopes [`REQUEST_ID`] around the rest of the
//! chain, so any log line emitted while serving a request can pick the id up
//! without it being threaded through every call.

use chrono::Local;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

tokio::task_local! {
    /// Task-local storage for the current request ID.
    pub static REQUEST_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn current_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Shorten a secret-ish identifier for logs.
pub fn redact(value: &str) -> &str {
    let end = value
        .char_indices()
        .nth(8)
        .map(|(idx, _)| idx)
        .unwrap_or(value.len());
    &value[..end]
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` sets the base filter (default `info,cliproxy_gateway=debug`);
/// noisy HTTP crates are always clamped to `warn`. `LOG_FORMAT=json` emits
/// JSON lines, `NO_COLOR` disables ANSI colors.
pub fn init_logging() {
    let base_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,cliproxy_gateway=debug".to_string());

    // Appended after the base so RUST_LOG=trace cannot re-enable them
    let filter = EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    ));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    let no_color = std::env::var("NO_COLOR").is_ok();

    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_timer(LocalTime))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_timer(LocalTime)
                    .with_ansi(!no_color),
            )
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("Logging already initialized: {}", e);
    }
}
