//! End-to-end tests of the assembled request pipeline.

use axum::{
    body::{Body, Bytes},
    extract::Extension,
    http::{Request, StatusCode},
    response::Response,
    routing::{get, post},
    Router,
};
use cliproxy_gateway::{
    core::{config::AppConfig, jwt::AuthResult},
    Components,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const MIB: u64 = 1024 * 1024;

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limit.enabled = true;
    config.rate_limit.requests_per_minute = 60;
    config.rate_limit.burst = 5;
    config.validation.max_body_size = MIB;
    config
}

async fn whoami(auth: Option<Extension<AuthResult>>) -> String {
    match auth {
        Some(Extension(AuthResult::Authenticated(identity))) => identity.subject,
        Some(Extension(AuthResult::Anonymous)) => "anonymous".to_string(),
        None => "unannotated".to_string(),
    }
}

async fn panics() -> &'static str {
    panic!("handler exploded")
}

/// Router with test handlers; `hits` counts handler invocations.
fn app(components: &Components, hits: Arc<AtomicUsize>) -> Router {
    let echo_hits = hits.clone();
    let router = Router::new()
        .route(
            "/echo",
            post(move |body: Bytes| {
                let hits = echo_hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    body.len().to_string()
                }
            }),
        )
        .route(
            "/files/*path",
            get(move || {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "file"
                }
            }),
        )
        .route("/whoami", get(whoami))
        .route("/panic", get(panics));
    components.apply(router)
}

fn get_request(uri: &str, api_key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-api-key", api_key)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_burst_then_denied_with_headers() {
    let components = Components::new(&test_config()).unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    for i in 0..5 {
        let response = app
            .clone()
            .oneshot(get_request("/files/a", "k1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "5");
        assert_eq!(
            response.headers()["x-ratelimit-remaining"],
            (4 - i).to_string().as_str()
        );
    }

    let denied = app.oneshot(get_request("/files/a", "k1")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
    let retry_after: u64 = denied.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert!(denied.headers().contains_key("x-request-id"));

    let body: serde_json::Value = serde_json::from_str(&body_string(denied).await).unwrap();
    assert_eq!(body["error"]["code"], "rate_limited");
}

#[tokio::test]
async fn test_oversized_body_rejected_before_metrics_and_handler() {
    let components = Components::new(&test_config()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(&components, hits.clone());
    let metrics = components.metrics.clone().unwrap();

    let ten_mib = vec![b'a'; (10 * MIB) as usize];
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("content-length", ten_mib.len().to_string())
                .body(Body::from(ten_mib))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.inflight("/echo"), 0);
    assert_eq!(metrics.request_count("POST", "/echo", 413), 0);
    assert_eq!(metrics.validation_failure_count("body_too_large"), 1);

    // Exactly at the limit is accepted
    let at_limit = vec![b'a'; MIB as usize];
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("content-length", at_limit.len().to_string())
                .body(Body::from(at_limit))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, MIB.to_string());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_validation_runs_before_rate_limit() {
    let mut config = test_config();
    config.rate_limit.burst = 1;
    let components = Components::new(&config).unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    let rejected = app
        .clone()
        .oneshot(get_request("/files/%2e%2e/secret", "k2"))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = serde_json::from_str(&body_string(rejected).await).unwrap();
    assert_eq!(body["error"]["code"], "path_traversal");

    // The rejected request did not spend the single token
    let allowed = app
        .clone()
        .oneshot(get_request("/files/ok", "k2"))
        .await
        .unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);

    let denied = app.oneshot(get_request("/files/ok", "k2")).await.unwrap();
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_rate_limited_requests_are_not_in_request_metrics() {
    let mut config = test_config();
    config.rate_limit.burst = 1;
    let components = Components::new(&config).unwrap();
    let metrics = components.metrics.clone().unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    for _ in 0..3 {
        let _ = app
            .clone()
            .oneshot(get_request("/files/x", "k3"))
            .await
            .unwrap();
    }

    assert_eq!(metrics.request_count("GET", "/files/*path", 200), 1);
    assert_eq!(metrics.request_count("GET", "/files/*path", 429), 0);
    assert_eq!(metrics.rate_limit_rejection_count(), 2);
}

#[tokio::test]
async fn test_optional_auth_annotates_without_rejecting() {
    let mut config = test_config();
    config.jwt.secret = "pipeline-secret".to_string();
    let components = Components::new(&config).unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    let anonymous = app
        .clone()
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::OK);
    assert_eq!(body_string(anonymous).await, "anonymous");

    let invalid = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("authorization", "Bearer not.a.jwt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::OK);
    assert_eq!(body_string(invalid).await, "anonymous");

    let token = components
        .jwt
        .as_ref()
        .unwrap()
        .issue("alice", Duration::from_secs(60), Default::default())
        .unwrap();
    let authenticated = app
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_string(authenticated).await, "alice");
}

#[tokio::test]
async fn test_without_secret_requests_are_unannotated() {
    let components = Components::new(&test_config()).unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    let response = app
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_string(response).await, "unannotated");
}

#[tokio::test]
async fn test_required_auth_rejects_anonymous() {
    let mut config = test_config();
    config.jwt.secret = "pipeline-secret".to_string();
    let components = Components::new(&config).unwrap();

    let protected = components.require_auth(Router::new().route("/whoami", get(whoami)));
    let app = components.apply(protected);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/whoami").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = components
        .jwt
        .as_ref()
        .unwrap()
        .issue("bob", Duration::from_secs(60), Default::default())
        .unwrap();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/whoami")
                .header("authorization", format!("Bearer {}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "bob");
}

#[tokio::test]
async fn test_request_id_echoed_on_every_response() {
    let components = Components::new(&test_config()).unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    let ok = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/files/a")
                .header("x-request-id", "req-42")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.headers()["x-request-id"], "req-42");

    let rejected = app
        .oneshot(
            Request::builder()
                .uri("/files/..")
                .header("x-request-id", "req-43")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    assert_eq!(rejected.headers()["x-request-id"], "req-43");
}

#[tokio::test]
async fn test_panic_is_recovered_as_500() {
    let components = Components::new(&test_config()).unwrap();
    let metrics = components.metrics.clone().unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/panic")
                .header("x-request-id", "req-panic")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.headers()["x-request-id"], "req-panic");
    assert_eq!(metrics.inflight("/panic"), 0);
    assert_eq!(metrics.request_count("GET", "/panic", 500), 1);

    let body = body_string(response).await;
    assert!(!body.contains("exploded"));

    // The service keeps serving
    let response = app.oneshot(get_request("/files/a", "k9")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_body_above_axum_default_cap_reaches_handler() {
    // Defaults allow 10 MiB, well past axum's built-in 2 MiB cap
    let components = Components::new(&AppConfig::default()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let app = app(&components, hits.clone());
    let metrics = components.metrics.clone().unwrap();

    let three_mib = vec![b'a'; (3 * MIB) as usize];
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("content-length", three_mib.len().to_string())
                .body(Body::from(three_mib))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, (3 * MIB).to_string());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Without Content-Length the streaming check still applies the configured limit
    let eleven_mib = vec![b'a'; (11 * MIB) as usize];
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .body(Body::from_stream(futures::stream::iter(vec![
                    Ok::<_, std::io::Error>(eleven_mib),
                ])))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(body["error"]["code"], "body_too_large");
    assert_eq!(metrics.validation_failure_count("body_too_large"), 1);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unmatched_paths_share_one_metrics_series() {
    let components = Components::new(&test_config()).unwrap();
    let metrics = components.metrics.clone().unwrap();
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    for path in ["/scan/wp-admin", "/scan/phpmyadmin", "/scan/.env", "/scan/backup.zip"] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    let text = metrics.scrape().unwrap();
    assert!(!text.contains("/scan/"));

    assert_eq!(metrics.request_count("GET", "unmatched", 404), 4);
    assert_eq!(metrics.inflight("unmatched"), 0);
}

#[tokio::test]
async fn test_disabled_components_are_skipped() {
    let mut config = AppConfig::default();
    config.metrics.enabled = false;
    config.validation.max_body_size = 0;
    let components = Components::new(&config).unwrap();
    assert!(components.metrics.is_none());
    assert!(components.rate_limiter.is_none());
    let app = app(&components, Arc::new(AtomicUsize::new(0)));

    for _ in 0..20 {
        let response = app
            .clone()
            .oneshot(get_request("/files/a", "same-key"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!response.headers().contains_key("x-ratelimit-limit"));
    }
}
