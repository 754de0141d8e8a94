//! Flight throughput benchmark
//!
//! Benchmarks the critical path: submit -> do each step -> release to
//! SUCCESS, driven entirely through the engine façade against an in-memory
//! journal. This is the core admission/dispatch performance metric, distinct
//! from `concurrent_flights`, which stresses ownership contention instead.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use stairway::context::{FlightContext, FlightStatus};
use stairway::journal::{InMemoryJournal, Journal};
use stairway::registry::FlightFactory;
use stairway::retry::NoRetry;
use stairway::step::{FlightDebugInfo, Step, StepResult};
use stairway::{Stairway, StairwayConfig};

struct NoopStep;

#[async_trait]
impl Step for NoopStep {
    async fn do_(&self, _ctx: &mut FlightContext) -> StepResult {
        StepResult::success()
    }
}

fn factory(step_count: usize) -> FlightFactory {
    Arc::new(move || {
        (0..step_count)
            .map(|_| (Arc::new(NoopStep) as Arc<dyn Step>, Box::new(NoRetry) as Box<_>))
            .collect()
    })
}

async fn wait_all_success(journal: &InMemoryJournal, flight_ids: &[String]) {
    let mut remaining: Vec<String> = flight_ids.to_vec();
    while !remaining.is_empty() {
        let mut still_pending = Vec::with_capacity(remaining.len());
        for id in remaining {
            let done = matches!(
                journal.load(&id).await.unwrap().map(|r| r.state.status),
                Some(FlightStatus::Success)
            );
            if !done {
                still_pending.push(id);
            }
        }
        remaining = still_pending;
        if !remaining.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// Single flight, varying step-list length: submit-to-success latency.
fn bench_single_flight_by_step_count(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("flight_throughput/single");
    group.throughput(Throughput::Elements(1));

    for step_count in [1, 5, 20] {
        group.bench_with_input(
            BenchmarkId::new("steps", step_count),
            &step_count,
            |b, &step_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let journal = Arc::new(InMemoryJournal::new());
                    let engine = Stairway::new(journal.clone(), StairwayConfig::new());
                    engine.register_flight("BenchFlight", factory(step_count));
                    engine.initialize(true).await.unwrap();
                    engine.recover_and_start(&[]).await.unwrap();

                    let start = Instant::now();
                    for _ in 0..iters {
                        let flight_id = engine
                            .submit("BenchFlight", BTreeMap::new(), false, FlightDebugInfo::default())
                            .await
                            .unwrap();
                        wait_all_success(&journal, &[flight_id]).await;
                    }
                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Many flights submitted up front, measuring sustained throughput as the
/// engine's worker pool drains its local queue.
fn bench_batch_submission_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("flight_throughput/batch");
    group.sample_size(20);

    for flight_count in [50u64, 200, 1000] {
        group.throughput(Throughput::Elements(flight_count));
        group.bench_with_input(
            BenchmarkId::new("flights", flight_count),
            &flight_count,
            |b, &flight_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let journal = Arc::new(InMemoryJournal::new());
                        let config = StairwayConfig::new().with_max_parallel_flights(32);
                        let engine = Stairway::new(journal.clone(), config);
                        engine.register_flight("BenchFlight", factory(3));
                        engine.initialize(true).await.unwrap();
                        engine.recover_and_start(&[]).await.unwrap();

                        let start = Instant::now();
                        let mut ids = Vec::with_capacity(flight_count as usize);
                        for _ in 0..flight_count {
                            ids.push(
                                engine
                                    .submit("BenchFlight", BTreeMap::new(), false, FlightDebugInfo::default())
                                    .await
                                    .unwrap(),
                            );
                        }
                        wait_all_success(&journal, &ids).await;
                        total += start.elapsed();
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_flight_by_step_count,
    bench_batch_submission_throughput,
);

criterion_main!(benches);
