//! Tracing and telemetry instrumentation for tributary.
//!
//! Span constructors for the job lifecycle plus `record_*` helpers that log
//! an event and, with the `metrics` feature enabled, update the matching
//! Prometheus metric. Every helper works with the feature off.
//!
//! # Example
//!
//! ```ignore
//! use tributary::telemetry::{job_span, record_job_start, record_job_end};
//!
//! let span = job_span(&request_id, &worker_id, "run");
//! let timing = record_job_start(&request_id);
//! // ... execute the job inside `span`
//! record_job_end(timing, "native", "success");
//! ```

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{info_span, Instrument, Span};

/// Span covering one execution of a job on a worker.
#[must_use]
pub fn job_span(
    request_id: impl AsRef<str>,
    worker_id: impl AsRef<str>,
    entry_point: impl AsRef<str>,
) -> Span {
    info_span!(
        "tributary.job",
        request_id = %request_id.as_ref(),
        worker_id = %worker_id.as_ref(),
        entry_point = %entry_point.as_ref(),
    )
}

/// Span covering a dispatcher deploy: script upload or resolution plus handoff.
#[must_use]
pub fn deploy_span(request_id: impl AsRef<str>, framework: impl AsRef<str>) -> Span {
    info_span!(
        "tributary.submit",
        request_id = %request_id.as_ref(),
        framework = %framework.as_ref(),
    )
}

/// Span covering every attempt of one result poll.
#[must_use]
pub fn poll_span(url: impl AsRef<str>) -> Span {
    info_span!("tributary.poll", url = %url.as_ref())
}

/// Attach a [`job_span`] to a future.
pub fn instrument_job<F>(
    request_id: impl AsRef<str>,
    worker_id: impl AsRef<str>,
    entry_point: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_span(request_id, worker_id, entry_point))
}

/// A job was handed to a worker, by a pool or by the dispatcher.
pub fn record_job_submitted(request_id: impl AsRef<str>, worker_id: impl AsRef<str>) {
    tracing::debug!(
        request_id = %request_id.as_ref(),
        worker_id = %worker_id.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted();
}

/// A pending job received its outcome.
///
/// `status` is `success` or the [`JobError::kind`](crate::error::JobError::kind)
/// of the failure.
pub fn record_job_completed(request_id: impl AsRef<str>, status: impl AsRef<str>) {
    tracing::debug!(
        request_id = %request_id.as_ref(),
        status = %status.as_ref(),
        "job completed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_completed(status.as_ref());
}

pub fn record_worker_spawned(worker_id: impl AsRef<str>) {
    tracing::debug!(worker_id = %worker_id.as_ref(), "worker spawned");

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_spawned();
}

/// A worker left its pool. The `failed` jobs it held have already been
/// resolved with an error.
pub fn record_worker_exit(worker_id: impl AsRef<str>, cause: impl AsRef<str>, failed: usize) {
    tracing::debug!(
        worker_id = %worker_id.as_ref(),
        cause = %cause.as_ref(),
        failed,
        "worker exited"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_worker_exit(cause.as_ref(), failed);
}

/// Jobs failed with `Cancelled` during a teardown.
pub fn record_jobs_cancelled(count: usize) {
    if count == 0 {
        return;
    }
    tracing::debug!(count, "jobs cancelled");

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_cancelled(count);
}

pub fn record_poll_attempt(url: impl AsRef<str>, attempt: u32) {
    tracing::trace!(url = %url.as_ref(), attempt, "polling for result");

    #[cfg(feature = "metrics")]
    crate::metrics::record_poll_attempt();
}

/// Start timing one job execution. Pass the handle to [`record_job_end`].
pub fn record_job_start(request_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        request_id: request_id.as_ref().to_string(),
        start: Instant::now(),
    }
}

pub fn record_job_end(handle: JobTimingHandle, framework: impl AsRef<str>, status: impl AsRef<str>) {
    let duration_secs = handle.elapsed().as_secs_f64();
    tracing::info!(
        request_id = %handle.request_id,
        framework = %framework.as_ref(),
        status = %status.as_ref(),
        duration_secs,
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(framework.as_ref(), status.as_ref(), duration_secs);
}

/// Opaque timer returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    request_id: String,
    start: Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
