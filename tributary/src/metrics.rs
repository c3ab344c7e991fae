//! Prometheus metrics for tributary pools, dispatchers and pollers.
//!
//! Compiled only with the `metrics` feature. Hosts call [`init_metrics`]
//! once and expose [`gather_metrics`] on whatever endpoint they serve.
//!
//! # Metrics
//!
//! ## Counters
//! - `tributary_jobs_submitted_total` - Jobs handed to a worker
//! - `tributary_jobs_completed_total` - Jobs resolved, by status
//! - `tributary_workers_spawned_total` - Worker runtimes started
//! - `tributary_worker_crashes_total` - Workers that exited abnormally, by cause
//! - `tributary_poll_attempts_total` - Result fetch attempts
//!
//! ## Gauges
//! - `tributary_pool_in_flight` - Jobs submitted and not yet resolved
//!
//! ## Histograms
//! - `tributary_job_duration_seconds` - Execution time on a worker
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, CounterVec, Gauge, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
};
use std::sync::LazyLock;

/// Registry holding every tributary metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_SUBMITTED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tributary_jobs_submitted_total", "Jobs handed to a worker")
        .expect("tributary_jobs_submitted_total metric creation failed")
});

/// Labels:
/// - `status`: `success` or the error kind
pub static JOBS_COMPLETED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("tributary_jobs_completed_total", "Jobs resolved with an outcome");
    CounterVec::new(opts, &["status"]).expect("tributary_jobs_completed_total metric creation failed")
});

pub static WORKERS_SPAWNED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tributary_workers_spawned_total", "Worker runtimes started")
        .expect("tributary_workers_spawned_total metric creation failed")
});

/// Labels:
/// - `cause`: `crashed`, `aborted`, `finished` or `terminated`
pub static WORKER_CRASHES_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "tributary_worker_crashes_total",
        "Workers removed from a pool before shutdown",
    );
    CounterVec::new(opts, &["cause"]).expect("tributary_worker_crashes_total metric creation failed")
});

pub static POLL_ATTEMPTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("tributary_poll_attempts_total", "Result fetch attempts")
        .expect("tributary_poll_attempts_total metric creation failed")
});

pub static POOL_IN_FLIGHT: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("tributary_pool_in_flight", "Jobs submitted and not yet resolved")
        .expect("tributary_pool_in_flight metric creation failed")
});

/// Labels:
/// - `framework`: `native` or `interpreted`
/// - `status`: `success` or the error kind
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets = exponential_buckets(0.001, 2.0, 15).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "tributary_job_duration_seconds",
        "Job execution time on a worker in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["framework", "status"])
        .expect("tributary_job_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_COMPLETED_TOTAL.clone()),
        Box::new(WORKERS_SPAWNED_TOTAL.clone()),
        Box::new(WORKER_CRASHES_TOTAL.clone()),
        Box::new(POLL_ATTEMPTS_TOTAL.clone()),
        Box::new(POOL_IN_FLIGHT.clone()),
        Box::new(JOB_DURATION_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            if !matches!(e, prometheus::Error::AlreadyReg) {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_submitted() {
    JOBS_SUBMITTED_TOTAL.inc();
    POOL_IN_FLIGHT.inc();
}

pub fn record_job_completed(status: &str) {
    JOBS_COMPLETED_TOTAL.with_label_values(&[status]).inc();
    POOL_IN_FLIGHT.dec();
}

pub fn record_worker_spawned() {
    WORKERS_SPAWNED_TOTAL.inc();
}

pub fn record_worker_exit(cause: &str, failed: usize) {
    WORKER_CRASHES_TOTAL.with_label_values(&[cause]).inc();
    POOL_IN_FLIGHT.sub(failed as f64);
}

pub fn record_jobs_cancelled(count: usize) {
    JOBS_COMPLETED_TOTAL
        .with_label_values(&["cancelled"])
        .inc_by(count as f64);
    POOL_IN_FLIGHT.sub(count as f64);
}

pub fn record_poll_attempt() {
    POLL_ATTEMPTS_TOTAL.inc();
}

pub fn observe_job_duration(framework: &str, status: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[framework, status])
        .observe(duration_secs);
}

/// Encode every registered metric in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
