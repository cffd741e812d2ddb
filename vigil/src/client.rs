use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use crate::config::{KeySpace, VigilConfig};
use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{DeadLetterEntry, JobId, JobState, JobStatus, NewScanJob, ScanJob};
use crate::ledger::{JobLedger, StatusUpdate};
use crate::policy::DeadLetterSink;
use crate::queue::QueueSnapshot;
use crate::store::QueueStore;
use crate::telemetry;

/// Submission and inspection API used by producers and dashboards.
pub struct JobClient<S: QueueStore> {
    ledger: JobLedger<S>,
    dead_letters: DeadLetterSink<S>,
    events: Arc<InProcEventBus>,
}

impl<S: QueueStore> Clone for JobClient<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            dead_letters: self.dead_letters.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<S: QueueStore> std::fmt::Debug for JobClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClient")
            .field("keys", self.ledger.keys())
            .finish_non_exhaustive()
    }
}

impl<S: QueueStore> JobClient<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        let dead_letters = DeadLetterSink::new(Arc::clone(&store), keys.dead_letters());
        Self {
            ledger: JobLedger::new(store, keys),
            dead_letters,
            events: Arc::new(InProcEventBus::default()),
        }
    }

    pub fn from_config(store: Arc<S>, config: &VigilConfig) -> Self {
        Self::new(store, config.keys.clone())
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = events;
        self
    }

    pub fn ledger(&self) -> &JobLedger<S> {
        &self.ledger
    }

    /// Record a job and make it available to workers.
    ///
    /// A missing id is generated and unrecognized option keys are dropped
    /// with a warning.
    pub async fn submit(&self, request: NewScanJob) -> anyhow::Result<ScanJob> {
        let NewScanJob {
            job_id,
            config_name,
            targets,
            mut options,
        } = request;
        let job_id = job_id.unwrap_or_else(JobId::generate);

        let dropped = options.strip_unrecognized();
        if !dropped.is_empty() {
            warn!(job_id = %job_id, keys = ?dropped, "ignoring unrecognized job options");
        }

        let mut job = ScanJob::new(job_id, targets).with_options(options);
        if let Some(name) = config_name {
            job = job.with_config_name(name);
        }

        let span = telemetry::job_submit_span(&job.job_id, &job.config_name);
        let job = self.ledger.submit(job).instrument(span).await?;

        telemetry::record_job_submitted(&job.job_id, &job.config_name);
        self.events.emit(
            None,
            JobEventPayload::Submitted {
                job_id: job.job_id.clone(),
                targets: job.targets.len(),
            },
        );
        Ok(job)
    }

    pub async fn status(&self, job_id: &JobId) -> anyhow::Result<Option<JobStatus>> {
        self.ledger.status(job_id).await
    }

    /// Statuses of jobs currently owned by some worker.
    pub async fn active_jobs(&self) -> anyhow::Result<Vec<JobStatus>> {
        self.ledger.active_jobs().await
    }

    /// Report locations appended so far, in target order.
    pub async fn results(&self, job_id: &JobId) -> anyhow::Result<Vec<String>> {
        self.ledger.results(job_id).await
    }

    /// Dead-lettered jobs, most recent first.
    pub async fn dead_letters(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        self.dead_letters.entries().await
    }

    pub async fn queue_depth(&self) -> anyhow::Result<usize> {
        let depth = self.ledger.queue().depth().await?;
        telemetry::set_queue_depth(self.ledger.keys().jobs(), depth);
        Ok(depth)
    }

    pub async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let inflight = self.ledger.inflight_entries().await?.len();
        self.ledger.queue().snapshot(inflight).await
    }

    /// Put an aborted job back on the queue with its retry count unchanged.
    ///
    /// Decided from the aborted index and the ownership index, never from
    /// the status record. Returns `false` if the job is not aborted, is
    /// owned by a worker, or its definition is gone.
    pub async fn resume_aborted(&self, job_id: &JobId) -> anyhow::Result<bool> {
        if let Some(owner) = self.ledger.inflight_owner(job_id).await? {
            debug!(job_id = %job_id, owner = %owner, "not resuming job owned by a worker");
            return Ok(false);
        }
        if !self.ledger.take_aborted(job_id).await? {
            return Ok(false);
        }
        let Some(job) = self.ledger.fetch_details(job_id).await? else {
            warn!(job_id = %job_id, "aborted job has no definition to resume");
            return Ok(false);
        };

        self.ledger
            .update_status(job_id, StatusUpdate::state(JobState::Queued))
            .await?;
        self.ledger.queue().enqueue(&job).await?;
        info!(job_id = %job_id, retry_count = job.retry_count, "resumed aborted job");
        Ok(true)
    }
}
