use core::hint::black_box;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::future::try_join_all;
use sluice::{Admission, RateLimiter, Result, WorkerManager};
use std::{
    sync::{Arc, Barrier},
    thread::scope,
    time::{Duration, Instant},
};
use tokio::runtime::Builder;

// Requests issued per benchmark iteration (per-thread for multi-threaded).
const TOTAL_REQUESTS: usize = 4096;

// Jobs executed per benchmark iteration.
const TOTAL_JOBS: usize = 1024;

/// Benchmarks increment-then-check on a single hot key.
fn bench_limiter_single_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter/single_key");
    group.throughput(Throughput::Elements(TOTAL_REQUESTS as u64));

    group.bench_function(format!("elems/{}", TOTAL_REQUESTS), |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                let limiter = RateLimiter::new(u64::MAX, Duration::from_secs(60)).unwrap();
                for _ in 0..TOTAL_REQUESTS {
                    black_box(limiter.admit("client"));
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}

/// Benchmarks many threads admitting distinct keys against one limiter.
fn bench_limiter_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("limiter/contended");

    for num_threads in [1, 2, 4, 8] {
        let total = TOTAL_REQUESTS * num_threads;
        group.throughput(Throughput::Elements(total as u64));
        group.bench_function(
            format!("elems/{}/threads/{}", total, num_threads),
            |b| {
                b.iter_custom(|iters| {
                    let keys: Vec<String> =
                        (0..num_threads).map(|i| format!("10.0.0.{i}")).collect();
                    let start = Instant::now();

                    for _ in 0..iters {
                        let limiter = RateLimiter::new(u64::MAX, Duration::from_secs(60)).unwrap();
                        let barrier = Barrier::new(num_threads);
                        scope(|s| {
                            for key in &keys {
                                let limiter = &limiter;
                                let barrier = &barrier;
                                s.spawn(move || {
                                    barrier.wait();
                                    for _ in 0..TOTAL_REQUESTS {
                                        black_box(limiter.admit(key));
                                    }
                                });
                            }
                        });
                    }

                    start.elapsed()
                });
            },
        );
    }

    group.finish();
}

/// Benchmarks round-trip execution of trivial jobs through the pool with an
/// increasing number of concurrent callers.
fn bench_pool_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool/execute");
    group.sample_size(10);
    group.throughput(Throughput::Elements(TOTAL_JOBS as u64));

    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for pool_size in [1, 4, 16] {
        for callers in [1, 16, 64] {
            let jobs_per_caller = TOTAL_JOBS / callers;

            group.bench_function(
                format!("elems/{}/workers/{}/callers/{}", TOTAL_JOBS, pool_size, callers),
                |b| {
                    let admission = rt.block_on(async {
                        let pool = Arc::new(WorkerManager::new(pool_size).unwrap());
                        let limiter =
                            Arc::new(RateLimiter::new(u64::MAX, Duration::from_secs(60)).unwrap());
                        Admission::new(pool, limiter)
                    });

                    b.to_async(&rt).iter_custom(|iters| {
                        let admission = admission.clone();
                        async move {
                            let start = Instant::now();

                            for _ in 0..iters {
                                let tasks = (0..callers).map(|caller| {
                                    let admission = admission.clone();
                                    tokio::spawn(async move {
                                        for job in 0..jobs_per_caller {
                                            black_box(admission.execute(move || caller ^ job).await?);
                                        }
                                        Ok::<_, sluice::Error>(())
                                    })
                                });

                                for result in try_join_all(tasks).await.unwrap() {
                                    let result: Result<()> = result;
                                    result.unwrap();
                                }
                            }

                            start.elapsed()
                        }
                    });

                    rt.block_on(admission.pool().shutdown()).unwrap();
                },
            );
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_limiter_single_key,
    bench_limiter_contended,
    bench_pool_execute,
);
criterion_main!(benches);
