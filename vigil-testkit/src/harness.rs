use std::sync::Arc;

use vigil::{
    FailureHandler, InProcEventBus, JobClient, JobExecutor, JobLedger, KeySpace,
    LivenessConfig, LivenessTracker, RecoverySweeper, RetryPolicy, ScanJob, WorkerConfig,
    WorkerPoolBuilder,
};

use crate::job::scan_request;
use crate::mock::{RecordingReporter, ScriptedEngine};
use crate::store::MemoryQueueStore;

/// One shared in-memory store with every component wired against it.
///
/// Components built from the same harness see the same keys, retry policy
/// and event bus, the way separate processes share one Redis.
#[derive(Clone, Debug)]
pub struct TestHarness {
    pub store: Arc<MemoryQueueStore>,
    pub keys: KeySpace,
    pub policy: RetryPolicy,
    pub liveness_config: LivenessConfig,
    pub events: Arc<InProcEventBus>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryQueueStore::new()),
            keys: KeySpace::default(),
            policy: RetryPolicy::default(),
            liveness_config: LivenessConfig::default(),
            events: Arc::new(InProcEventBus::default()),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.policy = RetryPolicy::new(max_retries);
        self
    }

    pub fn with_liveness(mut self, config: LivenessConfig) -> Self {
        self.liveness_config = config;
        self
    }

    pub fn client(&self) -> JobClient<MemoryQueueStore> {
        JobClient::new(Arc::clone(&self.store), self.keys.clone())
            .with_events(Arc::clone(&self.events))
    }

    pub fn ledger(&self) -> JobLedger<MemoryQueueStore> {
        JobLedger::new(Arc::clone(&self.store), self.keys.clone())
    }

    pub fn liveness(&self) -> LivenessTracker<MemoryQueueStore> {
        LivenessTracker::new(
            Arc::clone(&self.store),
            self.keys.clone(),
            self.liveness_config.clone(),
        )
    }

    pub fn failures(&self) -> FailureHandler<MemoryQueueStore> {
        FailureHandler::new(self.ledger(), self.policy.clone(), Arc::clone(&self.events))
    }

    pub fn sweeper(&self, sweeper_id: &str) -> RecoverySweeper<MemoryQueueStore> {
        RecoverySweeper::new(
            sweeper_id,
            self.ledger(),
            self.liveness(),
            self.failures(),
            Arc::clone(&self.events),
        )
    }

    pub fn executor(
        &self,
        worker_id: &str,
        engine: &ScriptedEngine,
        reporter: &RecordingReporter,
    ) -> JobExecutor<MemoryQueueStore> {
        JobExecutor::new(
            worker_id,
            self.ledger(),
            self.failures(),
            Arc::new(engine.clone()),
            Arc::new(reporter.clone()),
            Arc::clone(&self.events),
            WorkerConfig::default().default_max_duration_secs,
        )
    }

    /// Pool builder sharing this harness's store, keys, policy and events.
    pub fn pool(
        &self,
        config: WorkerConfig,
        engine: &ScriptedEngine,
    ) -> WorkerPoolBuilder<MemoryQueueStore> {
        WorkerPoolBuilder::new(config)
            .with_keys(self.keys.clone())
            .with_retry_policy(self.policy.clone())
            .with_liveness(self.liveness_config.clone())
            .with_store(Arc::clone(&self.store))
            .with_engine(Arc::new(engine.clone()))
            .with_events(Arc::clone(&self.events))
    }

    /// Submit `job_id` over `n` targets through the client.
    pub async fn submit(&self, job_id: &str, n: usize) -> anyhow::Result<ScanJob> {
        self.client().submit(scan_request(job_id, n)).await
    }

    /// Simulate a dead worker: its heartbeat key disappears.
    pub fn kill_worker(&self, worker_id: &str) -> bool {
        self.store.expire(&self.keys.heartbeat(worker_id))
    }

    /// Raw dispatch list, head first.
    pub fn queued_ids(&self) -> Vec<String> {
        self.store
            .list(&self.keys.jobs())
            .iter()
            .filter_map(|raw| ScanJob::from_json(raw).ok())
            .map(|job| job.job_id.to_string())
            .collect()
    }

    pub fn inflight(&self) -> std::collections::HashMap<String, String> {
        self.store.hash(&self.keys.inflight())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
