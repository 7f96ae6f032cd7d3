//! Benchmarks for the per-request admission path
//!
//! This benchmark measures:
//! - Token bucket consume under a saturated and an idle bucket
//! - Sliding window checks for one hot identity and many distinct identities
//! - Unit submission into the accumulator

use admission_core::batch::{worker_fn, BatchAccumulator, BatchConfig, WorkPayload};
use admission_core::resilience::sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
use admission_core::resilience::token_bucket::{TokenBucket, TokenBucketConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;

fn bench_token_bucket(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_bucket");

    let saturated = TokenBucket::new(TokenBucketConfig::new().with_rate(1.0).with_capacity(1.0));
    group.bench_function("consume_saturated", |b| {
        b.iter(|| black_box(saturated.consume(black_box(1.0))))
    });

    let idle = TokenBucket::new(TokenBucketConfig::new().with_rate(1e9).with_capacity(1e9));
    group.bench_function("consume_ready", |b| {
        b.iter(|| black_box(idle.consume(black_box(1.0))))
    });

    group.finish();
}

fn bench_sliding_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("sliding_window");

    for limit in [60u32, 1000] {
        let limiter = SlidingWindowLimiter::new(
            SlidingWindowConfig::new()
                .with_requests_per_minute(limit)
                .with_requests_per_hour(limit),
        );
        group.bench_with_input(BenchmarkId::new("hot_identity", limit), &limiter, |b, l| {
            b.iter(|| black_box(l.is_allowed(black_box("10.0.0.1"))))
        });
    }

    let identities: Vec<String> = (0..1024).map(|i| format!("10.0.{}.{}", i / 256, i % 256)).collect();
    let limiter = SlidingWindowLimiter::new(SlidingWindowConfig::new());
    group.throughput(Throughput::Elements(identities.len() as u64));
    group.bench_function("many_identities", |b| {
        b.iter(|| {
            for id in &identities {
                black_box(limiter.is_allowed(id));
            }
            limiter.evict_idle()
        })
    });

    group.finish();
}

fn bench_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("accumulator");

    let worker = Arc::new(worker_fn(|p: WorkPayload| async move {
        Ok::<_, admission_core::Error>(serde_json::json!(p.data.len()))
    }));
    let config = BatchConfig::new()
        .with_max_batch_size(64)
        .with_batch_timeout(Duration::from_secs(3600))
        .with_max_concurrent_batches(4);
    let acc = BatchAccumulator::new(config, worker);

    group.bench_function("submit", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(acc.submit(WorkPayload::new(&b"page"[..]))) })
    });

    rt.block_on(acc.shutdown());
    group.finish();
}

criterion_group!(benches, bench_token_bucket, bench_sliding_window, bench_submit);
criterion_main!(benches);
