//! Circuit breaker admission overhead.

use convoy::{BreakerConfig, CircuitBreaker, ExecError};
use criterion::{criterion_group, criterion_main, Criterion};
use std::time::Duration;

fn breaker_admission(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();

    c.bench_function("closed_breaker_execute", |b| {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        b.to_async(&runtime).iter(|| async {
            let result: Result<u64, ExecError> =
                breaker.execute(|| async { Ok(criterion::black_box(42)) }).await;
            criterion::black_box(result).ok();
        });
    });

    c.bench_function("open_breaker_rejection", |b| {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 0.5,
            min_requests: 1,
            recovery: Duration::from_secs(3600),
            ..BreakerConfig::default()
        });
        breaker.record_failure();
        b.to_async(&runtime).iter(|| async {
            let result: Result<u64, ExecError> =
                breaker.execute(|| async { Ok(criterion::black_box(42)) }).await;
            criterion::black_box(result).ok();
        });
    });

    c.bench_function("can_execute_gate", |b| {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        b.iter(|| criterion::black_box(breaker.can_execute().is_allowed()));
    });
}

criterion_group!(benches, breaker_admission);
criterion_main!(benches);
