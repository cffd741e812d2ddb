use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::engine::{panic_message, ResultReporter, ScanEngine, ScanError, ScanResultPayload};
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{JobState, ScanJob};
use crate::ledger::{JobLedger, StatusUpdate};
use crate::policy::{FailureHandler, FailureOutcome};
use crate::store::QueueStore;
use crate::telemetry;

use super::supervisor::ShutdownToken;

/// Anything that ends a job execution early and is routed to the retry
/// policy.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("store operation failed: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// How one execution of a job ended on this worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Shutdown stopped the job after `completed` targets.
    Aborted { completed: usize },
    Failed(FailureOutcome),
    /// Shutdown began before the failure could be recorded. The job stays
    /// owned by this worker until its retired heartbeat lapses and a sweeper
    /// reclaims it.
    Unresolved,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Aborted { .. } => "aborted",
            JobOutcome::Failed(outcome) => outcome.as_str(),
            JobOutcome::Unresolved => "unresolved",
        }
    }
}

const FAILURE_RETRY_INITIAL: Duration = Duration::from_millis(500);
const FAILURE_RETRY_MAX: Duration = Duration::from_secs(30);

enum RunEnd {
    Finished,
    Interrupted { completed: usize },
}

/// Runs a single job from ownership through to a terminal or queued state.
pub struct JobExecutor<S: QueueStore> {
    worker_id: String,
    ledger: JobLedger<S>,
    failures: FailureHandler<S>,
    engine: Arc<dyn ScanEngine>,
    reporter: Arc<dyn ResultReporter>,
    events: Arc<InProcEventBus>,
    default_max_duration_secs: u64,
}

impl<S: QueueStore> std::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("worker_id", &self.worker_id)
            .field("default_max_duration_secs", &self.default_max_duration_secs)
            .finish_non_exhaustive()
    }
}

impl<S: QueueStore> JobExecutor<S> {
    pub fn new(
        worker_id: impl Into<String>,
        ledger: JobLedger<S>,
        failures: FailureHandler<S>,
        engine: Arc<dyn ScanEngine>,
        reporter: Arc<dyn ResultReporter>,
        events: Arc<InProcEventBus>,
        default_max_duration_secs: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            ledger,
            failures,
            engine,
            reporter,
            events,
            default_max_duration_secs,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute `job` on this worker.
    ///
    /// Shutdown is checked before every target; a target already running is
    /// allowed to finish. Every error, including a panicking engine, is
    /// handed to the retry policy, which also clears this worker's ownership.
    pub async fn process_job(&self, job: ScanJob, shutdown: &ShutdownToken) -> JobOutcome {
        let job_id = job.job_id.clone();
        telemetry::instrument_process(&job_id, &self.worker_id, async {
            let timing = telemetry::record_job_start(&job.job_id);
            let outcome = match self.run(&job, shutdown).await {
                Ok(RunEnd::Finished) => match self.complete(&job).await {
                    Ok(()) => JobOutcome::Completed,
                    Err(err) => self.fail(&job, JobError::Store(err), shutdown).await,
                },
                Ok(RunEnd::Interrupted { completed }) => match self.abort(&job, completed).await {
                    Ok(()) => JobOutcome::Aborted { completed },
                    Err(err) => self.fail(&job, JobError::Store(err), shutdown).await,
                },
                Err(err) => self.fail(&job, err, shutdown).await,
            };
            telemetry::record_job_end(timing, outcome.as_str());
            outcome
        })
        .await
    }

    async fn run(&self, job: &ScanJob, shutdown: &ShutdownToken) -> Result<RunEnd, JobError> {
        let total = job.targets.len();
        self.ledger.set_inflight(&job.job_id, &self.worker_id).await?;
        self.ledger
            .update_status(
                &job.job_id,
                StatusUpdate::state(JobState::Running)
                    .worker(&self.worker_id)
                    .config_name(&job.config_name)
                    .progress(0, total)
                    .started_now(),
            )
            .await?;
        self.events.emit(
            Some(&self.worker_id),
            JobEventPayload::Started {
                job_id: job.job_id.clone(),
                retry_count: job.retry_count,
            },
        );

        let max_duration = job.max_duration(self.default_max_duration_secs);
        for (idx, target) in job.targets.iter().enumerate() {
            if shutdown.is_cancelled() {
                return Ok(RunEnd::Interrupted { completed: idx });
            }

            self.ledger
                .update_status(
                    &job.job_id,
                    StatusUpdate::new()
                        .progress(idx + 1, total)
                        .current_target(target),
                )
                .await?;

            let artifact = self.scan(target, max_duration).await?;
            self.ledger
                .append_result(&job.job_id, &artifact.location)
                .await?;

            let payload = ScanResultPayload::from_artifact(
                &job.job_id,
                &job.config_name,
                job.options.scan_type.as_deref(),
                target,
                &self.worker_id,
                &artifact,
            );
            match AssertUnwindSafe(self.reporter.post_result(&payload))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!(job_id = %job.job_id, target = %target, "failed to report result: {err:#}")
                }
                Err(panic) => warn!(
                    job_id = %job.job_id,
                    target = %target,
                    "result reporter panicked: {}",
                    panic_message(&*panic)
                ),
            }

            self.events.emit(
                Some(&self.worker_id),
                JobEventPayload::TargetFinished {
                    job_id: job.job_id.clone(),
                    target: target.clone(),
                    completed: idx + 1,
                    total,
                    report_location: artifact.location,
                },
            );
        }
        Ok(RunEnd::Finished)
    }

    async fn scan(
        &self,
        target: &str,
        max_duration: Duration,
    ) -> Result<crate::engine::ReportArtifact, ScanError> {
        debug!(target = %target, max_secs = max_duration.as_secs(), "scanning target");
        let scan =
            AssertUnwindSafe(self.engine.run_target_scan(target, max_duration)).catch_unwind();
        match tokio::time::timeout(max_duration, scan).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(ScanError::Engine(format!(
                "panicked: {}",
                panic_message(&*panic)
            ))),
            Err(_) => Err(ScanError::Timeout {
                target: target.to_string(),
                limit: max_duration,
            }),
        }
    }

    async fn complete(&self, job: &ScanJob) -> anyhow::Result<()> {
        let total = job.targets.len();
        self.ledger
            .update_status(
                &job.job_id,
                StatusUpdate::state(JobState::Completed)
                    .progress(total, total)
                    .finished_now(),
            )
            .await?;
        self.ledger.clear_inflight(&job.job_id).await?;
        self.ledger.purge(&job.job_id).await?;
        self.events.emit(
            Some(&self.worker_id),
            JobEventPayload::Completed {
                job_id: job.job_id.clone(),
            },
        );
        Ok(())
    }

    /// The definition stays in the ledger so the job can be resumed.
    async fn abort(&self, job: &ScanJob, completed: usize) -> anyhow::Result<()> {
        self.ledger.mark_aborted(&job.job_id, &self.worker_id).await?;
        self.ledger.clear_inflight(&job.job_id).await?;
        self.ledger
            .update_status(
                &job.job_id,
                StatusUpdate::state(JobState::Aborted).finished_now(),
            )
            .await?;
        warn!(job_id = %job.job_id, completed, total = job.targets.len(), "job aborted by shutdown");
        self.events.emit(
            Some(&self.worker_id),
            JobEventPayload::Aborted {
                job_id: job.job_id.clone(),
                completed,
            },
        );
        Ok(())
    }

    /// Route a failure to the retry policy.
    ///
    /// A store error while recording is retried with backoff until it
    /// succeeds or shutdown begins.
    async fn fail(&self, job: &ScanJob, err: JobError, shutdown: &ShutdownToken) -> JobOutcome {
        let message = err.to_string();
        warn!(job_id = %job.job_id, "job failed: {message}");

        let mut delay = FAILURE_RETRY_INITIAL;
        loop {
            let err = match self.failures.handle_failure(&job.job_id, &message).await {
                Ok(outcome) => return JobOutcome::Failed(outcome),
                Err(err) => err,
            };
            if shutdown.is_cancelled() {
                error!(job_id = %job.job_id, "could not record job failure before shutdown: {err:#}");
                return JobOutcome::Unresolved;
            }
            warn!(
                job_id = %job.job_id,
                retry_in_ms = delay.as_millis() as u64,
                "could not record job failure, retrying: {err:#}"
            );
            tokio::select! {
                _ = shutdown.cancelled() => {
                    error!(job_id = %job.job_id, "shutdown while recording job failure");
                    return JobOutcome::Unresolved;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(FAILURE_RETRY_MAX);
        }
    }
}
