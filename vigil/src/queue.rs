use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::KeySpace;
use crate::job::ScanJob;
use crate::store::QueueStore;

/// FIFO shared by every worker in the fleet.
///
/// Producers push at the head and workers pop from the tail, so jobs run in
/// submission order. An element handed to one `dequeue` is never handed to
/// another.
pub struct DispatchQueue<S: QueueStore> {
    store: Arc<S>,
    key: String,
}

impl<S: QueueStore> Clone for DispatchQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            key: self.key.clone(),
        }
    }
}

impl<S: QueueStore> std::fmt::Debug for DispatchQueue<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchQueue").field("key", &self.key).finish()
    }
}

impl<S: QueueStore> DispatchQueue<S> {
    pub fn new(store: Arc<S>, keys: KeySpace) -> Self {
        Self {
            store,
            key: keys.jobs(),
        }
    }

    pub async fn enqueue(&self, job: &ScanJob) -> anyhow::Result<()> {
        self.store.lpush(&self.key, &job.to_json()?).await
    }

    /// Put a popped job back where the next `dequeue` will find it.
    ///
    /// Used when a worker pops a job after it has started shutting down.
    pub async fn return_to_front(&self, job: &ScanJob) -> anyhow::Result<()> {
        self.store.rpush(&self.key, &job.to_json()?).await
    }

    /// Pop the oldest job, waiting up to `timeout`.
    ///
    /// Entries that do not decode are discarded and logged as an
    /// inconsistency. Nothing recovers their ledger record, if one exists;
    /// the raw entry is logged so an operator can resubmit it.
    pub async fn dequeue(&self, timeout: Duration) -> anyhow::Result<Option<ScanJob>> {
        let Some(raw) = self.store.brpop(&self.key, timeout).await? else {
            return Ok(None);
        };
        match ScanJob::from_json(&raw) {
            Ok(job) => Ok(Some(job)),
            Err(err) => {
                error!(queue = %self.key, entry = %raw, "dropping undecodable queue entry: {err:#}");
                Ok(None)
            }
        }
    }

    pub async fn depth(&self) -> anyhow::Result<usize> {
        self.store.llen(&self.key).await
    }

    /// Point-in-time view of queue and ownership sizes.
    pub async fn snapshot(&self, inflight_count: usize) -> anyhow::Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            sampled_at: Utc::now(),
            queue: self.key.clone(),
            ready_count: self.depth().await?,
            inflight_count,
        })
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub sampled_at: DateTime<Utc>,
    pub queue: String,
    /// Jobs waiting to be popped.
    pub ready_count: usize,
    /// Jobs currently owned by a worker.
    pub inflight_count: usize,
}

impl QueueSnapshot {
    pub fn total_count(&self) -> usize {
        self.ready_count + self.inflight_count
    }
}
