use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::KeySpace;
use crate::job::{JobId, JobState, JobStatus, ScanJob};
use crate::queue::DispatchQueue;
use crate::store::QueueStore;

/// A batch of status fields written in one store call.
///
/// Every update carries a fresh `last_updated` stamp, so no status write can
/// leave that field stale.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StatusUpdate {
    fields: Vec<(String, String)>,
}

impl StatusUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(state: JobState) -> Self {
        Self::new().with_state(state)
    }

    pub fn with_state(self, state: JobState) -> Self {
        self.field("state", state.as_str())
    }

    pub fn progress(self, done: usize, total: usize) -> Self {
        self.field("progress", format!("{done}/{total}"))
    }

    pub fn current_target(self, target: &str) -> Self {
        self.field("current_target", target)
    }

    pub fn worker(self, worker_id: &str) -> Self {
        self.field("worker_id", worker_id)
    }

    pub fn config_name(self, name: &str) -> Self {
        self.field("config_name", name)
    }

    pub fn started_now(self) -> Self {
        self.field("started_at", Utc::now().to_rfc3339())
    }

    pub fn finished_now(self) -> Self {
        self.field("finished_at", Utc::now().to_rfc3339())
    }

    pub fn error(self, message: &str) -> Self {
        self.field("error", message)
    }

    pub fn dlq_reason(self, reason: &str) -> Self {
        self.field("dlq_reason", reason)
    }

    fn field(mut self, name: &str, value: impl Into<String>) -> Self {
        self.fields.retain(|(existing, _)| existing != name);
        self.fields.push((name.to_string(), value.into()));
        self
    }

    fn into_fields(self) -> Vec<(String, String)> {
        self.field("last_updated", Utc::now().to_rfc3339()).fields
    }
}

/// Durable record of job definitions, statuses and in-flight ownership.
///
/// The ledger is the only point of truth for what a job is and who owns it;
/// workers keep nothing beyond the job they are currently running.
pub struct JobLedger<S: QueueStore> {
    store: Arc<S>,
    keys: KeySpace,
    queue: DispatchQueue<S>,
}

impl<S: QueueStore> Clone for JobLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            queue: self.queue.clone(),
        }
    }
}

impl<S: QueueStore> std::fmt::Debug for JobLedger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLedger")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl<S: QueueStore> JobLedger<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        let queue = DispatchQueue::new(Arc::clone(&store), keys.clone());
        Self { store, keys, queue }
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn queue(&self) -> &DispatchQueue<S> {
        &self.queue
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    /// Record a new job and make it visible to workers.
    ///
    /// `retry_count` is stored as given; [`JobClient::submit`] builds new
    /// jobs with a count of 0. The definition is persisted before the queue
    /// push so a crash in between leaves a recoverable record rather than a
    /// lost job.
    ///
    /// [`JobClient::submit`]: crate::client::JobClient::submit
    pub async fn submit(&self, job: ScanJob) -> anyhow::Result<ScanJob> {
        self.persist(&job).await?;
        self.update_status(
            &job.job_id,
            StatusUpdate::state(JobState::Queued)
                .config_name(&job.config_name)
                .progress(0, job.targets.len()),
        )
        .await?;
        self.queue.enqueue(&job).await?;

        debug!(job_id = %job.job_id, targets = job.targets.len(), "job submitted");
        Ok(job)
    }

    /// Load a job definition. `None` means the ledger has no record of it.
    pub async fn fetch_details(
        &self,
        job_id: &JobId,
    ) -> anyhow::Result<Option<ScanJob>> {
        let raw = self
            .store
            .hget(&self.keys.job_details(), job_id.as_str())
            .await?;
        raw.map(|raw| ScanJob::from_json(&raw)).transpose()
    }

    /// Write (or overwrite) a job definition.
    pub async fn persist(&self, job: &ScanJob) -> anyhow::Result<()> {
        self.store
            .hset(&self.keys.job_details(), job.job_id.as_str(), &job.to_json()?)
            .await
    }

    /// Persist the definition, then push it back onto the dispatch queue.
    pub async fn requeue(&self, job: &ScanJob) -> anyhow::Result<()> {
        self.persist(job).await?;
        self.queue.enqueue(job).await
    }

    /// Remove a definition after terminal success or dead-lettering.
    pub async fn purge(&self, job_id: &JobId) -> anyhow::Result<bool> {
        self.store
            .hdel(&self.keys.job_details(), job_id.as_str())
            .await
    }

    pub async fn set_inflight(
        &self,
        job_id: &JobId,
        worker_id: &str,
    ) -> anyhow::Result<()> {
        self.store
            .hset(&self.keys.inflight(), job_id.as_str(), worker_id)
            .await
    }

    pub async fn clear_inflight(&self, job_id: &JobId) -> anyhow::Result<bool> {
        self.store.hdel(&self.keys.inflight(), job_id.as_str()).await
    }

    /// Clear ownership only while `worker_id` still holds it.
    ///
    /// Read and delete are separate store calls; this narrows, but does not
    /// close, the window in which a fresh owner could be removed.
    pub async fn release_inflight(
        &self,
        job_id: &JobId,
        worker_id: &str,
    ) -> anyhow::Result<bool> {
        match self.inflight_owner(job_id).await? {
            Some(owner) if owner == worker_id => self.clear_inflight(job_id).await,
            _ => Ok(false),
        }
    }

    pub async fn inflight_owner(
        &self,
        job_id: &JobId,
    ) -> anyhow::Result<Option<String>> {
        self.store.hget(&self.keys.inflight(), job_id.as_str()).await
    }

    /// Snapshot of the ownership index, ordered by job id.
    pub async fn inflight_entries(&self) -> anyhow::Result<Vec<(JobId, String)>> {
        let map = self.store.hgetall(&self.keys.inflight()).await?;
        let mut entries: Vec<(JobId, String)> = map
            .into_iter()
            .map(|(job_id, worker_id)| (JobId::from(job_id), worker_id))
            .collect();
        entries.sort();
        Ok(entries)
    }

    /// Record that `worker_id` stopped the job at a shutdown checkpoint.
    pub async fn mark_aborted(
        &self,
        job_id: &JobId,
        worker_id: &str,
    ) -> anyhow::Result<()> {
        self.store
            .hset(&self.keys.aborted(), job_id.as_str(), worker_id)
            .await
    }

    /// Remove the aborted marker. Only the caller that sees `true` may act
    /// on the abort.
    pub async fn take_aborted(&self, job_id: &JobId) -> anyhow::Result<bool> {
        self.store.hdel(&self.keys.aborted(), job_id.as_str()).await
    }

    pub async fn update_status(
        &self,
        job_id: &JobId,
        update: StatusUpdate,
    ) -> anyhow::Result<()> {
        self.store
            .hset_multiple(&self.keys.status(job_id), &update.into_fields())
            .await
    }

    pub async fn status(&self, job_id: &JobId) -> anyhow::Result<Option<JobStatus>> {
        let fields = self.store.hgetall(&self.keys.status(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(parse_status(job_id, fields)))
    }

    /// Statuses of every job currently in the ownership index.
    pub async fn active_jobs(&self) -> anyhow::Result<Vec<JobStatus>> {
        let mut active = Vec::new();
        for (job_id, worker_id) in self.inflight_entries().await? {
            match self.status(&job_id).await? {
                Some(status) => active.push(status),
                None => {
                    warn!(job_id = %job_id, worker_id = %worker_id, "in-flight job has no status record");
                }
            }
        }
        Ok(active)
    }

    pub async fn append_result(
        &self,
        job_id: &JobId,
        location: &str,
    ) -> anyhow::Result<()> {
        self.store.rpush(&self.keys.results(job_id), location).await
    }

    pub async fn results(&self, job_id: &JobId) -> anyhow::Result<Vec<String>> {
        self.store.lrange(&self.keys.results(job_id)).await
    }
}

fn parse_status(job_id: &JobId, mut fields: HashMap<String, String>) -> JobStatus {
    let state = fields.remove("state").and_then(|raw| match raw.parse() {
        Ok(state) => Some(state),
        Err(err) => {
            warn!(job_id = %job_id, "ignoring status field: {err}");
            None
        }
    });
    let mut timestamp = |name: &str| {
        fields.remove(name).and_then(|raw| {
            DateTime::parse_from_rfc3339(&raw)
                .ok()
                .map(|ts| ts.with_timezone(&Utc))
        })
    };
    let started_at = timestamp("started_at");
    let finished_at = timestamp("finished_at");
    let last_updated = timestamp("last_updated");

    JobStatus {
        job_id: job_id.clone(),
        state,
        progress: fields.remove("progress"),
        current_target: fields.remove("current_target"),
        worker_id: fields.remove("worker_id"),
        config_name: fields.remove("config_name"),
        started_at,
        finished_at,
        last_updated,
        error: fields.remove("error"),
        dlq_reason: fields.remove("dlq_reason"),
    }
}
