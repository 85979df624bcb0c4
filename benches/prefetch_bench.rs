//! Criterion benchmarks for the prefetch hot path
//!
//! Run with: cargo bench
//! Copies are unthrottled host memcpy, so these measure bookkeeping plus raw copy cost.

use adapter_prefetch::{
    AdapterId, InMemoryWeights, PoolConfig, PrefetchConfig, PrefetchOrchestrator, UsagePredictor,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::collections::BTreeSet;
use std::sync::Arc;

fn batch(ids: &[u64]) -> BTreeSet<AdapterId> {
    ids.iter().map(|&i| AdapterId::from(i)).collect()
}

/// Benchmark predict() against a full history window
fn bench_predict(c: &mut Criterion) {
    let mut group = c.benchmark_group("predict");

    for window in [10, 100, 1000] {
        let mut predictor = UsagePredictor::new(window);
        for i in 0..window as u64 {
            predictor.record_batch(&batch(&[i % 64, (i * 7) % 64, (i * 13) % 64]));
        }
        let current = batch(&[1, 2]);

        group.bench_with_input(BenchmarkId::new("window", window), &predictor, |b, p| {
            b.iter(|| black_box(p.predict(black_box(&current), 3)));
        });
    }

    group.finish();
}

/// Benchmark record_batch with window eviction active
fn bench_record(c: &mut Criterion) {
    let mut predictor = UsagePredictor::new(10);
    let mut i = 0u64;
    c.bench_function("record_batch", |b| {
        b.iter(|| {
            i += 1;
            predictor.record_batch(&batch(&[i % 32, (i + 5) % 32]));
        });
    });
}

/// Benchmark prepare_batch on a resident working set (no copies)
fn bench_prepare_resident(c: &mut Criterion) {
    let weights = Arc::new(InMemoryWeights::synthetic(4, 64 * 1024));
    let pool = PoolConfig {
        num_slots: 8,
        slot_bytes: 64 * 1024,
    };
    let mut orch = match PrefetchOrchestrator::new(&pool, PrefetchConfig::default(), weights) {
        Ok(orch) => orch,
        Err(e) => panic!("failed to build orchestrator: {}", e),
    };
    let required = batch(&[0, 1]);

    c.bench_function("prepare_batch/resident", |b| {
        b.iter(|| black_box(orch.prepare_batch(black_box(&required)).ok()));
    });
}

/// Benchmark a cold batch: blocking copies into freshly evicted slots
fn bench_prepare_cold(c: &mut Criterion) {
    let mut group = c.benchmark_group("prepare_batch/cold");

    for kb in [64usize, 1024] {
        let bytes = kb * 1024;
        let weights = Arc::new(InMemoryWeights::synthetic(2, bytes));
        let pool = PoolConfig {
            num_slots: 2,
            slot_bytes: bytes,
        };
        let config = PrefetchConfig {
            enable_prefetch: false,
            ..PrefetchConfig::default()
        };
        let mut orch = match PrefetchOrchestrator::new(&pool, config, weights) {
            Ok(orch) => orch,
            Err(e) => panic!("failed to build orchestrator: {}", e),
        };
        let required = batch(&[0, 1]);

        group.bench_with_input(BenchmarkId::new("kb", kb), &required, |b, required| {
            b.iter(|| {
                for uid in required {
                    orch.evict(uid);
                }
                black_box(orch.prepare_batch(required).ok())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_predict,
    bench_record,
    bench_prepare_resident,
    bench_prepare_cold,
);
criterion_main!(benches);
