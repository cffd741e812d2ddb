use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use crate::events::{InProcEventBus, JobEventPayload};
use crate::job::JobId;
use crate::ledger::JobLedger;
use crate::liveness::LivenessTracker;
use crate::policy::{FailureHandler, FailureOutcome};
use crate::runtime::ShutdownToken;
use crate::store::QueueStore;
use crate::telemetry;

/// How long a sweeper may hold the recovery claim on one job.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30);

/// Tally of one sweep pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// In-flight entries examined.
    pub inspected: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Orphans whose definition is gone; left in place for an operator.
    pub missing_definition: usize,
    /// Orphans resolved by someone else between snapshot and claim.
    pub contended: usize,
}

impl SweepReport {
    /// Jobs this pass moved off a dead worker.
    pub fn recovered(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}

#[derive(Debug)]
enum Recovery {
    Resolved(FailureOutcome),
    Contended,
}

/// Finds in-flight jobs whose owner stopped heartbeating and routes them
/// through the shared failure path.
///
/// Each orphan is resolved under a short-lived per-job claim, and the owner
/// is re-read after the claim is taken. Sweepers racing over the same dead
/// worker therefore requeue each orphan at most once.
pub struct RecoverySweeper<S: QueueStore> {
    sweeper_id: String,
    ledger: JobLedger<S>,
    liveness: LivenessTracker<S>,
    failures: FailureHandler<S>,
    events: Arc<InProcEventBus>,
}

impl<S: QueueStore> Clone for RecoverySweeper<S> {
    fn clone(&self) -> Self {
        Self {
            sweeper_id: self.sweeper_id.clone(),
            ledger: self.ledger.clone(),
            liveness: self.liveness.clone(),
            failures: self.failures.clone(),
            events: Arc::clone(&self.events),
        }
    }
}

impl<S: QueueStore + 'static> RecoverySweeper<S> {
    pub fn new(
        sweeper_id: impl Into<String>,
        ledger: JobLedger<S>,
        liveness: LivenessTracker<S>,
        failures: FailureHandler<S>,
        events: Arc<InProcEventBus>,
    ) -> Self {
        Self {
            sweeper_id: sweeper_id.into(),
            ledger,
            liveness,
            failures,
            events,
        }
    }

    pub fn sweeper_id(&self) -> &str {
        &self.sweeper_id
    }

    /// Run one pass over the ownership index.
    ///
    /// Errors while resolving a single job are logged and the pass moves on;
    /// only a failure to read the index itself aborts the pass.
    pub async fn sweep(&self) -> anyhow::Result<SweepReport> {
        let span = telemetry::sweep_span(&self.sweeper_id);
        async {
            let entries = self.ledger.inflight_entries().await?;
            let mut report = SweepReport::default();
            let mut liveness: HashMap<String, bool> = HashMap::new();

            for (job_id, worker_id) in entries {
                report.inspected += 1;

                let alive = match liveness.get(&worker_id) {
                    Some(alive) => *alive,
                    None => {
                        let alive = self.liveness.is_alive(&worker_id).await?;
                        liveness.insert(worker_id.clone(), alive);
                        alive
                    }
                };
                if alive {
                    continue;
                }

                match self.recover(&job_id, &worker_id).await {
                    Ok(Recovery::Resolved(outcome)) => {
                        self.tally(&mut report, &job_id, &worker_id, outcome)
                    }
                    Ok(Recovery::Contended) => {
                        debug!(job_id = %job_id, "orphan already handled elsewhere");
                        report.contended += 1;
                    }
                    Err(err) => {
                        warn!(job_id = %job_id, worker_id = %worker_id, "orphan recovery failed: {err:#}");
                    }
                }
            }

            if report.recovered() > 0 || report.missing_definition > 0 {
                info!(
                    inspected = report.inspected,
                    requeued = report.requeued,
                    dead_lettered = report.dead_lettered,
                    missing_definition = report.missing_definition,
                    contended = report.contended,
                    "sweep finished"
                );
            }
            Ok(report)
        }
        .instrument(span)
        .await
    }

    fn tally(
        &self,
        report: &mut SweepReport,
        job_id: &JobId,
        dead_worker: &str,
        outcome: FailureOutcome,
    ) {
        match outcome {
            FailureOutcome::Requeued { .. } => report.requeued += 1,
            FailureOutcome::DeadLettered { .. } => report.dead_lettered += 1,
            FailureOutcome::MissingDefinition => {
                report.missing_definition += 1;
                return;
            }
        }
        telemetry::record_job_recovered(job_id, dead_worker);
        self.events.emit(
            Some(&self.sweeper_id),
            JobEventPayload::Recovered {
                job_id: job_id.clone(),
                dead_worker: dead_worker.to_string(),
            },
        );
    }

    async fn recover(&self, job_id: &JobId, dead_worker: &str) -> anyhow::Result<Recovery> {
        let store = self.ledger.store();
        let claim_key = self.ledger.keys().recovery_claim(job_id);
        if !store
            .set_nx_ex(&claim_key, &self.sweeper_id, DEFAULT_CLAIM_TTL)
            .await?
        {
            return Ok(Recovery::Contended);
        }

        let result = self.recover_claimed(job_id, dead_worker).await;

        if let Err(err) = store.del(&claim_key).await {
            // The claim expires on its own.
            warn!(job_id = %job_id, "failed to release recovery claim: {err:#}");
        }
        result
    }

    async fn recover_claimed(
        &self,
        job_id: &JobId,
        dead_worker: &str,
    ) -> anyhow::Result<Recovery> {
        let owner = self.ledger.inflight_owner(job_id).await?;
        if owner.as_deref() != Some(dead_worker) {
            return Ok(Recovery::Contended);
        }
        if self.liveness.is_alive(dead_worker).await? {
            return Ok(Recovery::Contended);
        }

        let reason = format!("worker {dead_worker} heartbeat expired");
        let outcome = self.failures.handle_failure(job_id, &reason).await?;
        Ok(Recovery::Resolved(outcome))
    }

    /// Sweep every `interval` until `stop` fires. Failed passes are logged.
    pub fn spawn(&self, interval: Duration, stop: ShutdownToken) -> JoinHandle<()> {
        let sweeper = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(sweeper_id = %sweeper.sweeper_id, "sweeper shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = sweeper.sweep().await {
                            warn!(sweeper_id = %sweeper.sweeper_id, "sweep failed: {err:#}");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovered_counts_requeued_and_dead_lettered() {
        let report = SweepReport {
            inspected: 6,
            requeued: 2,
            dead_lettered: 1,
            missing_definition: 1,
            contended: 2,
        };
        assert_eq!(report.recovered(), 3);
        assert_eq!(SweepReport::default().recovered(), 0);
    }
}
