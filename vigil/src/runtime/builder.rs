use std::any::type_name;
use std::fmt;
use std::sync::Arc;

use crate::config::{KeySpace, LivenessConfig, VigilConfig};
use crate::engine::{ResultReporter, ScanEngine, TracingReporter};
use crate::events::InProcEventBus;
use crate::ledger::JobLedger;
use crate::liveness::LivenessTracker;
use crate::policy::{FailureHandler, RetryPolicy};
use crate::store::QueueStore;
use crate::sweeper::RecoverySweeper;

use super::executor::JobExecutor;
use super::supervisor::WorkerPool;
use super::worker::WorkerConfig;

/// Builder for a [`WorkerPool`] with explicit collaborators.
///
/// The store and the scan engine are required. Reporting defaults to
/// [`TracingReporter`] and events to a fresh [`InProcEventBus`].
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPoolBuilder::new(WorkerConfig::new("scanner-1"))
///     .with_store(store)
///     .with_engine(engine)
///     .with_retry_policy(RetryPolicy::new(3))
///     .build()?;
/// pool.start().await?;
/// ```
pub struct WorkerPoolBuilder<S: QueueStore + 'static> {
    config: WorkerConfig,
    keys: KeySpace,
    retry: RetryPolicy,
    liveness: LivenessConfig,
    store: Option<Arc<S>>,
    engine: Option<Arc<dyn ScanEngine>>,
    reporter: Option<Arc<dyn ResultReporter>>,
    events: Option<Arc<InProcEventBus>>,
}

impl<S: QueueStore + 'static> fmt::Debug for WorkerPoolBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerPoolBuilder");
        debug.field("config", &self.config);
        debug.field("keys", &self.keys);
        debug.field("retry", &self.retry);
        debug.field("liveness", &self.liveness);
        debug.field("store_set", &self.store.is_some());
        debug.field("engine_set", &self.engine.is_some());
        debug.field("reporter_set", &self.reporter.is_some());
        debug.field("events_set", &self.events.is_some());
        if self.store.is_some() {
            debug.field("store_type", &type_name::<S>());
        }
        debug.finish()
    }
}

impl<S: QueueStore + 'static> WorkerPoolBuilder<S> {
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            keys: KeySpace::default(),
            retry: RetryPolicy::default(),
            liveness: LivenessConfig::default(),
            store: None,
            engine: None,
            reporter: None,
            events: None,
        }
    }

    /// Start from a full process configuration.
    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(config.worker.clone())
            .with_keys(config.keys.clone())
            .with_retry_policy(config.retry.clone())
            .with_liveness(config.liveness.clone())
    }

    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessConfig) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_store(mut self, store: Arc<S>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn ScanEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ResultReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_events(mut self, events: Arc<InProcEventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and assemble the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the store or engine is missing or the
    /// configuration is invalid.
    pub fn build(self) -> anyhow::Result<WorkerPool<S>> {
        self.config.validate()?;
        self.liveness.validate()?;

        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store dependency missing"))?;
        let engine = self
            .engine
            .ok_or_else(|| anyhow::anyhow!("engine dependency missing"))?;
        let reporter = self
            .reporter
            .unwrap_or_else(|| Arc::new(TracingReporter));
        let events = self.events.unwrap_or_default();

        let ledger = JobLedger::new(Arc::clone(&store), self.keys.clone());
        let liveness = LivenessTracker::new(store, self.keys, self.liveness);
        let failures = FailureHandler::new(ledger.clone(), self.retry, Arc::clone(&events));

        let sweeper = self.config.run_sweeper.then(|| {
            RecoverySweeper::new(
                self.config.worker_id.clone(),
                ledger.clone(),
                liveness.clone(),
                failures.clone(),
                Arc::clone(&events),
            )
        });
        let executor = JobExecutor::new(
            self.config.worker_id.clone(),
            ledger.clone(),
            failures,
            Arc::clone(&engine),
            reporter,
            events,
            self.config.default_max_duration_secs,
        );

        Ok(WorkerPool::new(
            self.config,
            ledger,
            liveness,
            executor,
            sweeper,
            engine,
        ))
    }
}
