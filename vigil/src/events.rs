use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::JobId;

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    /// Worker that produced the event, `None` for client-side events.
    pub worker_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(worker_id: Option<&str>) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            worker_id: worker_id.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// Job lifecycle event with metadata and payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(worker_id: Option<&str>, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(worker_id),
            payload,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match &self.payload {
            JobEventPayload::Submitted { job_id, .. }
            | JobEventPayload::Started { job_id, .. }
            | JobEventPayload::TargetFinished { job_id, .. }
            | JobEventPayload::Completed { job_id }
            | JobEventPayload::Aborted { job_id, .. }
            | JobEventPayload::RetryQueued { job_id, .. }
            | JobEventPayload::DeadLettered { job_id, .. }
            | JobEventPayload::Recovered { job_id, .. } => job_id,
        }
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventPayload {
    /// Job was recorded in the ledger and pushed to the dispatch queue.
    Submitted { job_id: JobId, targets: usize },
    /// A worker took ownership of the job.
    Started { job_id: JobId, retry_count: u32 },
    /// One target finished scanning.
    TargetFinished {
        job_id: JobId,
        target: String,
        completed: usize,
        total: usize,
        report_location: String,
    },
    Completed { job_id: JobId },
    /// Shutdown interrupted the job between targets.
    Aborted { job_id: JobId, completed: usize },
    RetryQueued {
        job_id: JobId,
        retry_count: u32,
        error: String,
    },
    DeadLettered {
        job_id: JobId,
        retry_count: u32,
        reason: String,
    },
    /// The sweeper reclaimed the job from a worker whose heartbeat expired.
    Recovered { job_id: JobId, dead_worker: String },
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for subscribers. A subscriber that falls more than
/// `capacity` events behind receives `RecvError::Lagged` and resumes from
/// the oldest retained event. Events never leave the process.
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event to all current subscribers.
    ///
    /// With no subscribers the event is dropped.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn emit(&self, worker_id: Option<&str>, payload: JobEventPayload) {
        self.publish(JobEvent::new(worker_id, payload));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// Trait for subscribing to job lifecycle events.
pub trait JobEventStream: Send + Sync {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent>;
}

impl JobEventStream for InProcEventBus {
    fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.subscribe()
    }
}
