//! Benchmarks for pool throughput using criterion.
//!
//! Measures:
//! - Flat submission of independent jobs at different worker limits
//! - Recursive fan-out through a worker's child pool

#![allow(missing_docs)]

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use serde_json::json;
use tributary::{Framework, JobRequest};
use tributary_testkit::{fixture_scheduler, Fixture, FIXTURE_SCRIPT};

/// Benchmark: independent `echo` jobs submitted all at once.
fn bench_flat_submission(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let worker_limits = vec![1, 4, 8];
    let job_counts = vec![100, 1_000];

    let mut group = c.benchmark_group("pool_flat_submission");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for worker_limit in &worker_limits {
        for job_count in &job_counts {
            let bench_id = BenchmarkId::new(
                format!("{worker_limit}_workers"),
                format!("{job_count}_jobs"),
            );

            group.throughput(Throughput::Elements(*job_count as u64));
            group.bench_with_input(bench_id, &(*worker_limit, *job_count), |b, (limit, jobs)| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total_duration = Duration::ZERO;

                    for _ in 0..iters {
                        let fixture = Fixture::new();
                        let scheduler = fixture_scheduler(&fixture, *limit);
                        let pool = scheduler.pool();

                        let start = Instant::now();
                        let submissions = (0..*jobs).map(|idx| {
                            pool.submit(JobRequest::new(FIXTURE_SCRIPT, Framework::Native, "echo", json!(idx)))
                        });
                        for outcome in join_all(submissions).await {
                            outcome.expect("echo job should succeed");
                        }
                        total_duration += start.elapsed();

                        scheduler.shutdown();
                    }

                    total_duration
                });
            });
        }
    }

    group.finish();
}

/// Benchmark: one parent job fanning out `n` squares through its child pool.
fn bench_recursive_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("pool_recursive_fan_out");
    group.sample_size(10);

    for fan_out in [8usize, 64] {
        group.throughput(Throughput::Elements(fan_out as u64));
        group.bench_with_input(BenchmarkId::from_parameter(fan_out), &fan_out, |b, &fan_out| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total_duration = Duration::ZERO;

                for _ in 0..iters {
                    let fixture = Fixture::new();
                    let scheduler = fixture_scheduler(&fixture, 4);
                    let pool = scheduler.pool();
                    let items: Vec<usize> = (0..fan_out).collect();

                    let start = Instant::now();
                    pool.submit(JobRequest::new(FIXTURE_SCRIPT, Framework::Native, "sum_squares", json!(items)))
                        .await
                        .expect("fan-out should succeed");
                    total_duration += start.elapsed();

                    scheduler.shutdown();
                }

                total_duration
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_flat_submission, bench_recursive_fan_out);
criterion_main!(benches);
