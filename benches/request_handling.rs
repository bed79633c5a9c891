//! Benchmarks for the hot paths of the request pipeline.
//!
//! Run with: cargo bench --bench request_handling

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use cliproxy_gateway::core::{
    circuit_breaker::CircuitBreakerRegistry,
    config::{CircuitBreakerConfig, RateLimitConfig, ValidationConfig},
    error::AppError,
    metrics::normalize_path,
    rate_limiter::RateLimiter,
    validator::{check_path, RequestValidator, ValidationPolicy},
};
use axum::http::Request;

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");

    let limiter = RateLimiter::new(&RateLimitConfig {
        enabled: true,
        requests_per_minute: u32::MAX / 60,
        burst: 1_000_000,
    });

    group.throughput(Throughput::Elements(1));
    group.bench_function("allow_single_key", |b| {
        b.iter(|| black_box(limiter.allow(black_box("bench-key"))));
    });

    let keys: Vec<String> = (0..1000).map(|i| format!("key-{}", i)).collect();
    group.bench_function("allow_1000_keys", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.allow(&keys[i]))
        });
    });

    group.finish();
}

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    let breakers = CircuitBreakerRegistry::new(&CircuitBreakerConfig::default());
    group.bench_function("execute_closed", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let result = breakers
                    .execute("openai", || async { Ok::<u32, AppError>(1) })
                    .await;
                black_box(result.is_ok())
            })
        });
    });

    let mut disabled_config = CircuitBreakerConfig::default();
    disabled_config.enabled = false;
    let disabled = CircuitBreakerRegistry::new(&disabled_config);
    group.bench_function("execute_disabled", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let result = disabled
                    .execute("openai", || async { Ok::<u32, AppError>(1) })
                    .await;
                black_box(result.is_ok())
            })
        });
    });

    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");

    let paths = [
        "/v1/chat/completions",
        "/v1/files/abc/content",
        "/v1/%2e%2e/etc/passwd",
    ];
    for path in paths {
        group.bench_function(format!("check_path {}", path), |b| {
            b.iter(|| black_box(check_path(black_box(path))));
        });
    }

    let validator = RequestValidator::new(ValidationPolicy::from(&ValidationConfig::default()));
    let (parts, _) = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions?stream=true")
        .header("content-type", "application/json")
        .header("content-length", "512")
        .header("authorization", "Bearer sk-test")
        .body(())
        .unwrap()
        .into_parts();
    group.bench_function("validate_parts", |b| {
        b.iter(|| black_box(validator.validate_parts(black_box(&parts))));
    });

    group.bench_function("normalize_path", |b| {
        b.iter(|| {
            black_box(normalize_path(black_box(
                "/v1/threads/550e8400-e29b-41d4-a716-446655440000/messages/42",
            )))
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_rate_limiter,
    bench_circuit_breaker,
    bench_validation
);
criterion_main!(benches);
