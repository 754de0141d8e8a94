//! Concurrent flight contention benchmark
//!
//! Many workers racing against the same journal, with the unit of
//! contention a whole flight's ownership (`claim_owner`/`release_owner`)
//! rather than a single task row. Measures how `InMemoryJournal`'s
//! serialization discipline holds up as concurrent dispatcher loops scale.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use stairway::context::{Direction, FlightStatus};
use stairway::journal::{FlightState, InMemoryJournal, Journal};
use stairway::step::FlightDebugInfo;

async fn seed_ready_flights(journal: &InMemoryJournal, count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let flight_id = format!("bench-{i}");
        journal
            .create_flight(&flight_id, "BenchFlight", "seed-owner", BTreeMap::new(), FlightDebugInfo::default())
            .await
            .unwrap();
        journal
            .release_owner(
                &flight_id,
                "seed-owner",
                FlightState {
                    status: FlightStatus::Ready,
                    direction: Direction::Start,
                    step_index: 0,
                },
                None,
            )
            .await
            .unwrap();
        ids.push(flight_id);
    }
    ids
}

/// `worker_count` tasks race to claim a disjoint-by-construction pool of
/// `worker_count` ready flights, one each; measures wall-clock to drain the
/// pool as contention (number of concurrent claimers) scales.
fn bench_claim_owner_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent_flights/claim_owner");

    for worker_count in [2usize, 8, 32] {
        group.throughput(Throughput::Elements(worker_count as u64));
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let journal = Arc::new(InMemoryJournal::new());
                        let ids = seed_ready_flights(&journal, worker_count).await;

                        let start = Instant::now();
                        let mut handles = Vec::with_capacity(worker_count);
                        for (i, flight_id) in ids.into_iter().enumerate() {
                            let journal = journal.clone();
                            handles.push(tokio::spawn(async move {
                                journal.claim_owner(&flight_id, &format!("worker-{i}")).await.unwrap();
                            }));
                        }
                        for handle in handles {
                            handle.await.unwrap();
                        }
                        total += start.elapsed();
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

/// A fixed pool of `flight_count` ready flights contended by `worker_count`
/// racers each trying `claim_owner` on every flight id; counts successful
/// claims to confirm the at-most-one-owner invariant holds under load while
/// timing the race.
fn bench_claim_owner_contention(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("concurrent_flights/contention");
    group.sample_size(30);

    for worker_count in [4u64, 16, 64] {
        group.throughput(Throughput::Elements(worker_count));
        group.bench_with_input(
            BenchmarkId::new("racers", worker_count),
            &worker_count,
            |b, &worker_count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let journal = Arc::new(InMemoryJournal::new());
                        let ids = seed_ready_flights(&journal, 1).await;
                        let flight_id = ids.into_iter().next().unwrap();
                        let wins = Arc::new(AtomicU64::new(0));

                        let start = Instant::now();
                        let mut handles = Vec::with_capacity(worker_count as usize);
                        for i in 0..worker_count {
                            let journal = journal.clone();
                            let flight_id = flight_id.clone();
                            let wins = wins.clone();
                            handles.push(tokio::spawn(async move {
                                if journal.claim_owner(&flight_id, &format!("racer-{i}")).await.is_ok() {
                                    wins.fetch_add(1, Ordering::SeqCst);
                                }
                            }));
                        }
                        for handle in handles {
                            handle.await.unwrap();
                        }
                        assert_eq!(wins.load(Ordering::SeqCst), 1, "exactly one racer must win");
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
    bench_claim_owner_concurrent,
    bench_claim_owner_contention,
);

criterion_main!(benches);
