use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a scan job.
///
/// Ids are usually assigned by the submitter; [`JobId::generate`] produces a
/// time-ordered UUID v7 when none is supplied.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Recognized per-job options.
///
/// Keys outside this set are captured in `unrecognized` while decoding so
/// they can be reported and dropped at submission instead of travelling
/// with the job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Upper bound for a single target scan, in seconds.
    #[serde(
        default,
        alias = "max_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_duration_secs: Option<u64>,
    /// Scan profile requested by the submitter, passed to reporting only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    #[serde(flatten)]
    unrecognized: BTreeMap<String, serde_json::Value>,
}

impl JobOptions {
    pub fn with_max_duration(mut self, secs: u64) -> Self {
        self.max_duration_secs = Some(secs);
        self
    }

    pub fn with_scan_type(mut self, scan_type: impl Into<String>) -> Self {
        self.scan_type = Some(scan_type.into());
        self
    }

    /// Keys that were present on the wire but are not recognized options.
    pub fn unrecognized_keys(&self) -> Vec<&str> {
        self.unrecognized.keys().map(String::as_str).collect()
    }

    /// Drop unrecognized keys, returning their names.
    pub fn strip_unrecognized(&mut self) -> Vec<String> {
        std::mem::take(&mut self.unrecognized).into_keys().collect()
    }
}

/// Job definition as stored in the ledger and carried on the dispatch queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanJob {
    pub job_id: JobId,
    #[serde(default = "default_config_name")]
    pub config_name: String,
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: JobOptions,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_config_name() -> String {
    "unnamed".to_string()
}

impl ScanJob {
    pub fn new(job_id: impl Into<JobId>, targets: Vec<String>) -> Self {
        Self {
            job_id: job_id.into(),
            config_name: default_config_name(),
            targets,
            options: JobOptions::default(),
            retry_count: 0,
            last_error: None,
        }
    }

    pub fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = name.into();
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Per-target scan bound, falling back to `default_secs`.
    pub fn max_duration(&self, default_secs: u64) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.options.max_duration_secs.unwrap_or(default_secs),
        )
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Submission request accepted by the job client.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NewScanJob {
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub config_name: Option<String>,
    pub targets: Vec<String>,
    #[serde(default)]
    pub options: JobOptions,
}

impl NewScanJob {
    pub fn new(targets: Vec<String>) -> Self {
        Self {
            targets,
            ..Default::default()
        }
    }

    pub fn with_job_id(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_config_name(mut self, name: impl Into<String>) -> Self {
        self.config_name = Some(name.into());
        self
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RetryQueued,
    Aborted,
    Completed,
    DeadLetter,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::RetryQueued => "retry_queued",
            JobState::Aborted => "aborted",
            JobState::Completed => "completed",
            JobState::DeadLetter => "dead_letter",
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "retry_queued" => Ok(JobState::RetryQueued),
            "aborted" => Ok(JobState::Aborted),
            "completed" => Ok(JobState::Completed),
            "dead_letter" => Ok(JobState::DeadLetter),
            other => Err(anyhow::anyhow!("unknown job state: {other}")),
        }
    }
}

/// Observability projection of a job. Never consulted for control decisions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub state: Option<JobState>,
    pub progress: Option<String>,
    pub current_target: Option<String>,
    pub worker_id: Option<String>,
    pub config_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_updated: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub dlq_reason: Option<String>,
}

/// Immutable snapshot appended to the dead-letter sink.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    #[serde(flatten)]
    pub job: ScanJob,
    pub dlq_reason: String,
    pub failed_at: DateTime<Utc>,
}
