use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConfigError;

/// Configuration for one worker process.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Identity written to the ownership index and the heartbeat key.
    pub worker_id: String,
    /// Jobs executed concurrently by this process.
    pub concurrency: usize,
    /// Upper bound on one blocking pop, in seconds.
    pub poll_interval_secs: u64,
    /// Per-target scan bound for jobs that do not set one.
    pub default_max_duration_secs: u64,
    pub sweep_interval_secs: u64,
    /// Run a recovery sweeper in this process.
    pub run_sweeper: bool,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Self::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, secs: u64) -> Self {
        self.poll_interval_secs = secs;
        self
    }

    pub fn with_default_max_duration(mut self, secs: u64) -> Self {
        self.default_max_duration_secs = secs;
        self
    }

    pub fn with_sweep_interval(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn with_sweeper(mut self, enabled: bool) -> Self {
        self.run_sweeper = enabled;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("poll interval"));
        }
        if self.default_max_duration_secs == 0 {
            return Err(ConfigError::ZeroDuration("default max duration"));
        }
        if self.run_sweeper && self.sweep_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("sweep interval"));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4().simple()),
            concurrency: 5,
            poll_interval_secs: 5,
            default_max_duration_secs: 1800,
            sweep_interval_secs: 30,
            run_sweeper: true,
        }
    }
}
