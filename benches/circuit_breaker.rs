use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fabric_resilience::{Breaker, BreakerConfig, CallError, FailureCode, PipelineError};
use std::time::Duration;

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let config = BreakerConfig { failure_threshold: 10, reset_timeout: Duration::from_secs(30), ..BreakerConfig::default() };
    let breaker = Breaker::new("bench-success", config);

    c.bench_function("circuit_breaker_success_100k_rps", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let result: Result<&str, PipelineError<CallError>> =
                    breaker.execute(|| async { Ok("ok") }, |_: &CallError| FailureCode::Unavailable).await;
                black_box(result).ok();
            }
        });
    });
}

fn circuit_breaker_throughput_failure(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    // Opens on the first failure, so the bench measures the fast-reject path.
    let config = BreakerConfig { failure_threshold: 1, reset_timeout: Duration::from_secs(30), ..BreakerConfig::default() };
    let breaker = Breaker::new("bench-failure", config);

    c.bench_function("circuit_breaker_failure_100k_rps", |b| {
        b.to_async(&rt).iter(|| {
            let breaker = breaker.clone();
            async move {
                let result: Result<&str, PipelineError<CallError>> = breaker
                    .execute(|| async { Err(CallError::new(FailureCode::Unavailable, "down")) }, |e: &CallError| e.code)
                    .await;
                black_box(result).ok();
            }
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_failure);
criterion_main!(benches);
