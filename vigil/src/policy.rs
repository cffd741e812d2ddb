use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::{DeadLetterEntry, JobId, JobState, ScanJob};
use crate::ledger::{JobLedger, StatusUpdate};
use crate::store::QueueStore;

/// Retry bound applied to every job failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before a job is dead-lettered. A job is
    /// dead-lettered once its `retry_count` exceeds this value.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn decide(&self, retry_count: u32) -> RetryDecision {
        decide(retry_count, self.max_retries)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    Requeue,
    DeadLetter,
}

/// Route a job whose `retry_count` has already been incremented.
pub fn decide(retry_count: u32, max_retries: u32) -> RetryDecision {
    if retry_count > max_retries {
        RetryDecision::DeadLetter
    } else {
        RetryDecision::Requeue
    }
}

/// End state produced by [`FailureHandler::handle_failure`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureOutcome {
    Requeued { retry_count: u32 },
    DeadLettered { retry_count: u32 },
    /// The ledger had no definition; nothing was changed.
    MissingDefinition,
}

impl FailureOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureOutcome::Requeued { .. } => "requeued",
            FailureOutcome::DeadLettered { .. } => "dead_lettered",
            FailureOutcome::MissingDefinition => "missing_definition",
        }
    }
}

/// Append-only sequence of jobs that exhausted their retries.
pub struct DeadLetterSink<S: QueueStore> {
    store: Arc<S>,
    key: String,
}

impl<S: QueueStore> Clone for DeadLetterSink<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
        }
    }
}

impl<S: QueueStore> DeadLetterSink<S> {
    pub fn new(store: Arc<S>, key: String) -> Self {
        Self { store, key }
    }

    pub async fn append(&self, entry: &DeadLetterEntry) -> anyhow::Result<()> {
        self.store
            .lpush(&self.key, &serde_json::to_string(entry)?)
            .await
    }

    /// All entries, most recent first. Undecodable entries are skipped.
    pub async fn entries(&self) -> anyhow::Result<Vec<DeadLetterEntry>> {
        let raw = self.store.lrange(&self.key).await?;
        Ok(raw
            .iter()
            .filter_map(|raw| match serde_json::from_str(raw) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    warn!(dlq = %self.key, "skipping undecodable dead-letter entry: {err}");
                    None
                }
            })
            .collect())
    }

    pub async fn len(&self) -> anyhow::Result<usize> {
        self.store.llen(&self.key).await
    }
}

/// Single failure path shared by worker execution errors and sweeper
/// recovery. Identical `retry_count` inputs give identical end states
/// regardless of which caller reported the failure.
pub struct FailureHandler<S: QueueStore> {
    ledger: JobLedger<S>,
    dead_letters: DeadLetterSink<S>,
    policy: RetryPolicy,
    events: Arc<InProcEventBus>,
}

impl<S: QueueStore> Clone for FailureHandler<S> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            dead_letters: self.dead_letters.clone(),
            policy: self.policy.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<S: QueueStore> FailureHandler<S> {
    pub fn new(
        ledger: JobLedger<S>,
        policy: RetryPolicy,
        events: Arc<InProcEventBus>,
    ) -> Self {
        let dead_letters =
            DeadLetterSink::new(ledger.store(), ledger.keys().dead_letters());
        Self {
            ledger,
            dead_letters,
            policy,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn dead_letters(&self) -> &DeadLetterSink<S> {
        &self.dead_letters
    }

    /// Record a failure of `job_id` and requeue or dead-letter it.
    pub async fn handle_failure(
        &self,
        job_id: &JobId,
        error_message: &str,
    ) -> anyhow::Result<FailureOutcome> {
        let Some(mut job) = self.ledger.fetch_details(job_id).await? else {
            error!(job_id = %job_id, "cannot handle failure: job definition missing");
            return Ok(FailureOutcome::MissingDefinition);
        };
        let owner = self.ledger.inflight_owner(job_id).await?;

        job.retry_count = job.retry_count.saturating_add(1);
        job.last_error = Some(error_message.to_string());

        match self.policy.decide(job.retry_count) {
            RetryDecision::DeadLetter => self.dead_letter(job, error_message).await,
            RetryDecision::Requeue => self.requeue(job, error_message, owner).await,
        }
    }

    async fn requeue(
        &self,
        job: ScanJob,
        error_message: &str,
        owner: Option<String>,
    ) -> anyhow::Result<FailureOutcome> {
        let retry_count = job.retry_count;
        self.ledger
            .update_status(
                &job.job_id,
                StatusUpdate::state(JobState::RetryQueued).error(error_message),
            )
            .await?;
        self.ledger.requeue(&job).await?;
        self.ledger.take_aborted(&job.job_id).await?;
        // The job is visible again; only drop ownership if no new worker has
        // already claimed it.
        if let Some(owner) = owner {
            self.ledger.release_inflight(&job.job_id, &owner).await?;
        }

        warn!(
            job_id = %job.job_id,
            retry_count,
            max_retries = self.policy.max_retries,
            "job requeued after failure: {error_message}"
        );
        self.events.emit(
            None,
            JobEventPayload::RetryQueued {
                job_id: job.job_id.clone(),
                retry_count,
                error: error_message.to_string(),
            },
        );
        Ok(FailureOutcome::Requeued { retry_count })
    }

    async fn dead_letter(
        &self,
        job: ScanJob,
        error_message: &str,
    ) -> anyhow::Result<FailureOutcome> {
        let retry_count = job.retry_count;
        let reason = format!(
            "exceeded {} retries; last error: {error_message}",
            self.policy.max_retries
        );
        let job_id = job.job_id.clone();

        self.dead_letters
            .append(&DeadLetterEntry {
                job,
                dlq_reason: reason.clone(),
                failed_at: Utc::now(),
            })
            .await?;
        self.ledger
            .update_status(
                &job_id,
                StatusUpdate::state(JobState::DeadLetter)
                    .error(error_message)
                    .dlq_reason(&reason)
                    .finished_now(),
            )
            .await?;
        self.ledger.clear_inflight(&job_id).await?;
        self.ledger.take_aborted(&job_id).await?;
        self.ledger.purge(&job_id).await?;

        error!(job_id = %job_id, retry_count, "job moved to dead-letter queue: {reason}");
        self.events.emit(
            None,
            JobEventPayload::DeadLettered {
                job_id,
                retry_count,
                reason,
            },
        );
        Ok(FailureOutcome::DeadLettered { retry_count })
    }
}
