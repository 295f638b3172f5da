//! Microbenchmarks for the scheduler hot path.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cadence::scheduler::{InferStrategy, SlidingWindowEstimator, StrategyQueue, WorkTracker};

const MS: i64 = 1_000_000;

fn estimator_update_and_query(c: &mut Criterion) {
    c.bench_function("estimator_insert_estimate", |b| {
        let mut est = SlidingWindowEstimator::new(10, 0.99);
        let mut sample = 1u64;
        b.iter(|| {
            sample = sample.wrapping_mul(6364136223846793005).wrapping_add(1);
            est.insert(sample % 20_000_000);
            black_box(est.estimate())
        });
    });
}

fn work_tracker_churn(c: &mut Criterion) {
    c.bench_function("work_tracker_add_complete", |b| {
        let tracker = WorkTracker::new(8, 256, 100_000_000);
        for gpu in 0..8 {
            tracker.add_request(gpu, 10 * MS, 100_000_000, 0);
            if let Some(chosen) = tracker.load_model(gpu, false, 0) {
                tracker.load_model_complete(gpu, chosen, true);
            }
        }
        let mut model = 0usize;
        b.iter(|| {
            model = (model + 1) % 8;
            let demand = tracker.add_request(model, 5 * MS, 100_000_000, 0);
            tracker.request_completed(black_box(demand));
        });
    });
}

fn strategy_queue_throughput(c: &mut Criterion) {
    c.bench_function("strategy_push_pop", |b| {
        let mut queue = StrategyQueue::new();
        let mut t = 0u64;
        b.iter(|| {
            t += 1;
            queue.push(InferStrategy {
                priority: t ^ 0x5555,
                deadline: t + 100,
                request_id: t,
                batch_size: 4,
                version: 1,
                model_id: 0,
            });
            if queue.len() > 1024 {
                while let Some(s) = queue.pop() {
                    black_box(s);
                }
            }
        });
    });
}

criterion_group!(
    benches,
    estimator_update_and_query,
    work_tracker_churn,
    strategy_queue_throughput
);
criterion_main!(benches);
