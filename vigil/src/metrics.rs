//! Prometheus metrics for vigil workers.
//!
//! Compiled only with the `metrics` feature.
//!
//! # Metrics
//!
//! ## Counters
//! - `vigil_jobs_submitted_total` - Jobs accepted by a client
//! - `vigil_jobs_finished_total` - Job executions by outcome
//!   (`completed`, `aborted`, `requeued`, `dead_lettered`)
//! - `vigil_jobs_recovered_total` - Orphaned jobs reclaimed by a sweeper
//!
//! ## Gauges
//! - `vigil_queue_depth` - Jobs waiting on the dispatch queue
//! - `vigil_active_jobs` - Jobs executing in this process
//!
//! ## Histograms
//! - `vigil_job_duration_seconds` - Wall time of one job execution
#![cfg(feature = "metrics")]

use prometheus::{
    exponential_buckets, Counter, CounterVec, Gauge, GaugeVec, HistogramVec, Opts, Registry,
};
use std::sync::LazyLock;

/// Registry holding every vigil metric.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `config_name`.
pub static JOBS_SUBMITTED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new("vigil_jobs_submitted_total", "Total number of jobs submitted");
    CounterVec::new(opts, &["config_name"])
        .expect("vigil_jobs_submitted_total metric creation failed")
});

/// Labels: `outcome`.
pub static JOBS_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "vigil_jobs_finished_total",
        "Total number of job executions by outcome",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("vigil_jobs_finished_total metric creation failed")
});

/// Unlabelled; the dead worker id is only logged.
pub static JOBS_RECOVERED_TOTAL: LazyLock<Counter> = LazyLock::new(|| {
    Counter::new(
        "vigil_jobs_recovered_total",
        "Total number of orphaned jobs recovered",
    )
    .expect("vigil_jobs_recovered_total metric creation failed")
});

/// Labels: `queue`.
pub static QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("vigil_queue_depth", "Jobs waiting on the dispatch queue");
    GaugeVec::new(opts, &["queue"]).expect("vigil_queue_depth metric creation failed")
});

pub static ACTIVE_JOBS: LazyLock<Gauge> = LazyLock::new(|| {
    Gauge::new("vigil_active_jobs", "Jobs executing in this process")
        .expect("vigil_active_jobs metric creation failed")
});

/// Labels: `outcome`.
pub static JOB_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    // Scans run from seconds to hours.
    let buckets = exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = prometheus::HistogramOpts::new(
        "vigil_job_duration_seconds",
        "Job execution duration in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("vigil_job_duration_seconds metric creation failed")
});

/// Register all metrics with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_SUBMITTED_TOTAL.clone()) as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_FINISHED_TOTAL.clone()),
        Box::new(JOBS_RECOVERED_TOTAL.clone()),
        Box::new(QUEUE_DEPTH.clone()),
        Box::new(ACTIVE_JOBS.clone()),
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

pub fn record_job_submitted(config_name: &str) {
    JOBS_SUBMITTED_TOTAL.with_label_values(&[config_name]).inc();
}

pub fn record_job_finished(outcome: &str) {
    JOBS_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_job_recovered() {
    JOBS_RECOVERED_TOTAL.inc();
}

pub fn set_queue_depth(queue: &str, depth: f64) {
    QUEUE_DEPTH.with_label_values(&[queue]).set(depth);
}

pub fn set_active_jobs(count: f64) {
    ACTIVE_JOBS.set(count);
}

pub fn observe_job_duration(outcome: &str, duration_secs: f64) {
    JOB_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}
