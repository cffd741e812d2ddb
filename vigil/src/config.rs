use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobId;
use crate::policy::RetryPolicy;
use crate::runtime::WorkerConfig;

/// Errors raised while validating configuration.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error(
        "heartbeat interval ({interval_secs}s) must be shorter than its ttl ({ttl_secs}s)"
    )]
    HeartbeatSlack { interval_secs: u64, ttl_secs: u64 },

    #[error("worker concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),

    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Store key layout.
///
/// Everything except heartbeats lives under `namespace`; heartbeats use their
/// own prefix so several job namespaces can share a worker fleet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpace {
    pub namespace: String,
    pub heartbeat_prefix: String,
}

impl Default for KeySpace {
    fn default() -> Self {
        Self {
            namespace: "scan".to_string(),
            heartbeat_prefix: "worker:heartbeat".to_string(),
        }
    }
}

impl KeySpace {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Dispatch list.
    pub fn jobs(&self) -> String {
        format!("{}:jobs", self.namespace)
    }

    /// Ledger hash of job definitions.
    pub fn job_details(&self) -> String {
        format!("{}:job_details", self.namespace)
    }

    /// Ownership hash `job_id -> worker_id`.
    pub fn inflight(&self) -> String {
        format!("{}:inflight", self.namespace)
    }

    /// Hash of jobs stopped by shutdown, `job_id -> worker_id`.
    pub fn aborted(&self) -> String {
        format!("{}:aborted", self.namespace)
    }

    pub fn status(&self, job_id: &JobId) -> String {
        format!("{}:status:{}", self.namespace, job_id)
    }

    pub fn results(&self, job_id: &JobId) -> String {
        format!("{}:results:{}", self.namespace, job_id)
    }

    pub fn dead_letters(&self) -> String {
        format!("{}:dlq", self.namespace)
    }

    pub fn recovery_claim(&self, job_id: &JobId) -> String {
        format!("{}:recovery:{}", self.namespace, job_id)
    }

    pub fn heartbeat(&self, worker_id: &str) -> String {
        format!("{}:{}", self.heartbeat_prefix, worker_id)
    }
}

/// Heartbeat timing.
///
/// The refresh interval must stay strictly below the ttl so a worker gets
/// one missed refresh of slack before it is declared dead.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub heartbeat_ttl_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            heartbeat_ttl_secs: 60,
            heartbeat_interval_secs: 30,
        }
    }
}

impl LivenessConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.heartbeat_ttl_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration("heartbeat interval"));
        }
        if self.heartbeat_interval_secs >= self.heartbeat_ttl_secs {
            return Err(ConfigError::HeartbeatSlack {
                interval_secs: self.heartbeat_interval_secs,
                ttl_secs: self.heartbeat_ttl_secs,
            });
        }
        Ok(())
    }
}

/// Top-level configuration for a worker process or a submitting client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VigilConfig {
    /// Queue store connection string (e.g., "redis://localhost:6379/0").
    pub redis_url: String,
    pub keys: KeySpace,
    pub retry: RetryPolicy,
    pub liveness: LivenessConfig,
    pub worker: WorkerConfig,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            keys: KeySpace::default(),
            retry: RetryPolicy::default(),
            liveness: LivenessConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl VigilConfig {
    /// Build a configuration from process environment variables.
    ///
    /// Recognized: `REDIS_URL`, `SCAN_NAMESPACE`, `MAX_RETRIES`,
    /// `MAX_WORKERS`, `WORKER_ID`, `DEFAULT_MAX_DURATION`,
    /// `HEARTBEAT_TTL`, `HEARTBEAT_INTERVAL`, `SWEEP_INTERVAL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`VigilConfig::from_env`] with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(namespace) = lookup("SCAN_NAMESPACE") {
            config.keys.namespace = namespace;
        }
        if let Some(max) = parse_env(&lookup, "MAX_RETRIES")? {
            config.retry.max_retries = max;
        }
        if let Some(workers) = parse_env(&lookup, "MAX_WORKERS")? {
            config.worker.concurrency = workers;
        }
        if let Some(secs) = parse_env(&lookup, "DEFAULT_MAX_DURATION")? {
            config.worker.default_max_duration_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "HEARTBEAT_TTL")? {
            config.liveness.heartbeat_ttl_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "HEARTBEAT_INTERVAL")? {
            config.liveness.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = parse_env(&lookup, "SWEEP_INTERVAL")? {
            config.worker.sweep_interval_secs = secs;
        }
        config.worker.worker_id = lookup("WORKER_ID")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| config.worker.worker_id.clone());

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.liveness.validate()?;
        self.worker.validate()
    }
}

fn parse_env<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: raw }),
    }
}
