//! Tracing spans and recording helpers for the job lifecycle.
//!
//! Every `record_*` function logs through `tracing` and, with the `metrics`
//! feature enabled, also updates the matching Prometheus metric. The crate
//! never installs a subscriber; binaries choose their own.
//!
//! # Example
//!
//! ```ignore
//! use vigil::telemetry::{job_process_span, record_job_start};
//!
//! let span = job_process_span(&job_id, "worker-1");
//! let timing = record_job_start(&job_id);
//! // ... run the job inside `span`
//! record_job_end(timing, "completed");
//! ```

use std::future::Future;
use tracing::{info_span, Instrument, Span};

/// Span covering one execution of a job on a worker.
#[must_use]
pub fn job_process_span(job_id: impl AsRef<str>, worker_id: impl AsRef<str>) -> Span {
    info_span!(
        "vigil.process",
        job_id = %job_id.as_ref(),
        worker_id = %worker_id.as_ref(),
    )
}

/// Span covering a blocking pop from the dispatch queue.
#[must_use]
pub fn job_dequeue_span(worker_id: impl AsRef<str>) -> Span {
    info_span!("vigil.dequeue", worker_id = %worker_id.as_ref())
}

#[must_use]
pub fn job_submit_span(job_id: impl AsRef<str>, config_name: impl AsRef<str>) -> Span {
    info_span!(
        "vigil.submit",
        job_id = %job_id.as_ref(),
        config_name = %config_name.as_ref(),
    )
}

/// Span covering one recovery sweep.
#[must_use]
pub fn sweep_span(sweeper_id: impl AsRef<str>) -> Span {
    info_span!("vigil.sweep", sweeper_id = %sweeper_id.as_ref())
}

/// Attach a [`job_process_span`] to a future.
pub fn instrument_process<F>(
    job_id: impl AsRef<str>,
    worker_id: impl AsRef<str>,
    future: F,
) -> impl Future<Output = F::Output>
where
    F: Future,
{
    future.instrument(job_process_span(job_id, worker_id))
}

pub fn record_job_submitted(job_id: impl AsRef<str>, config_name: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        config_name = %config_name.as_ref(),
        "job submitted"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_submitted(config_name.as_ref());
}

/// Record the end of one job execution.
///
/// `outcome` is one of `completed`, `aborted`, `requeued` or
/// `dead_lettered`.
pub fn record_job_finished(job_id: impl AsRef<str>, outcome: impl AsRef<str>) {
    tracing::info!(
        job_id = %job_id.as_ref(),
        outcome = %outcome.as_ref(),
        "job finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_finished(outcome.as_ref());
}

pub fn record_job_recovered(job_id: impl AsRef<str>, dead_worker: impl AsRef<str>) {
    tracing::warn!(
        job_id = %job_id.as_ref(),
        dead_worker = %dead_worker.as_ref(),
        "recovered orphaned job"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_recovered();
}

pub fn set_queue_depth(queue: impl AsRef<str>, depth: usize) {
    tracing::debug!(queue = %queue.as_ref(), depth, "queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_queue_depth(queue.as_ref(), depth as f64);
}

pub fn set_active_jobs(count: usize) {
    tracing::trace!(count, "active jobs updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_active_jobs(count as f64);
}

/// Start timing a job execution. Pass the handle to [`record_job_end`].
pub fn record_job_start(job_id: impl AsRef<str>) -> JobTimingHandle {
    JobTimingHandle {
        job_id: job_id.as_ref().to_string(),
        start: std::time::Instant::now(),
    }
}

/// Finish timing a job execution and record its outcome.
pub fn record_job_end(handle: JobTimingHandle, outcome: impl AsRef<str>) {
    let duration_secs = handle.start.elapsed().as_secs_f64();
    tracing::debug!(
        job_id = %handle.job_id,
        outcome = %outcome.as_ref(),
        duration_secs,
        "job duration observed"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_job_duration(outcome.as_ref(), duration_secs);

    record_job_finished(&handle.job_id, outcome);
}

/// Opaque timer returned by [`record_job_start`].
#[derive(Debug)]
pub struct JobTimingHandle {
    job_id: String,
    start: std::time::Instant,
}

impl JobTimingHandle {
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
