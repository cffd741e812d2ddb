use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Severity counts for the findings of one target scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingSummary {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub informational: usize,
}

impl FindingSummary {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low + self.informational
    }
}

/// Output of a single target scan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifact {
    /// Where the engine wrote its report. Opaque to vigil.
    pub location: String,
    #[serde(default)]
    pub findings: FindingSummary,
}

impl ReportArtifact {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            findings: FindingSummary::default(),
        }
    }

    pub fn with_findings(mut self, findings: FindingSummary) -> Self {
        self.findings = findings;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan of {target} exceeded {}s", .limit.as_secs())]
    Timeout { target: String, limit: Duration },

    #[error("scan engine failed: {0}")]
    Engine(String),
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// The scanning collaborator driven by each job.
///
/// Implementations must honour `max_duration`; the executor also enforces
/// it from the outside and reports an overrun as [`ScanError::Timeout`].
#[async_trait]
pub trait ScanEngine: Send + Sync {
    async fn run_target_scan(
        &self,
        target: &str,
        max_duration: Duration,
    ) -> Result<ReportArtifact, ScanError>;

    /// Release engine resources once the worker pool has drained.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Per-target result handed to a [`ResultReporter`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanResultPayload {
    pub job_id: JobId,
    pub config_name: String,
    #[serde(rename = "url")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scan_type: Option<String>,
    pub total_vulnerabilities: usize,
    #[serde(rename = "high_sev")]
    pub high: usize,
    #[serde(rename = "medium_sev")]
    pub medium: usize,
    #[serde(rename = "low_sev")]
    pub low: usize,
    #[serde(rename = "info_sev")]
    pub informational: usize,
    #[serde(rename = "report_path")]
    pub report_location: String,
    pub worker_id: String,
}

impl ScanResultPayload {
    pub fn from_artifact(
        job_id: &JobId,
        config_name: &str,
        scan_type: Option<&str>,
        target: &str,
        worker_id: &str,
        artifact: &ReportArtifact,
    ) -> Self {
        Self {
            job_id: job_id.clone(),
            config_name: config_name.to_string(),
            target: target.to_string(),
            scan_type: scan_type.map(str::to_string),
            total_vulnerabilities: artifact.findings.total(),
            high: artifact.findings.high,
            medium: artifact.findings.medium,
            low: artifact.findings.low,
            informational: artifact.findings.informational,
            report_location: artifact.location.clone(),
            worker_id: worker_id.to_string(),
        }
    }
}

/// Downstream sink for per-target results.
///
/// Delivery is fire-and-forget: a failure is logged by the caller and never
/// changes job state.
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn post_result(&self, payload: &ScanResultPayload) -> anyhow::Result<()>;
}

/// Reporter that only logs each result.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

#[async_trait]
impl ResultReporter for TracingReporter {
    async fn post_result(&self, payload: &ScanResultPayload) -> anyhow::Result<()> {
        tracing::info!(
            job_id = %payload.job_id,
            target = %payload.target,
            total = payload.total_vulnerabilities,
            high = payload.high,
            medium = payload.medium,
            report = %payload.report_location,
            "scan result"
        );
        Ok(())
    }
}
