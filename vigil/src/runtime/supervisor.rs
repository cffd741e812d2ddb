use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn, Instrument};

use crate::engine::ScanEngine;
use crate::job::{JobId, ScanJob};
use crate::ledger::JobLedger;
use crate::liveness::LivenessTracker;
use crate::store::QueueStore;
use crate::sweeper::RecoverySweeper;
use crate::telemetry;

use super::executor::JobExecutor;
use super::worker::WorkerConfig;

/// Token for signaling graceful shutdown to workers.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not
        // missed between the check and the wait.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// A job currently executing in this process.
#[derive(Clone, Debug)]
pub struct ActiveJob {
    pub started_at: DateTime<Utc>,
    pub targets: usize,
}

type ActiveJobs = Arc<SyncMutex<HashMap<JobId, ActiveJob>>>;

/// Removes a job from the active set when its task ends, including by
/// unwinding.
struct ActiveJobGuard {
    active_jobs: ActiveJobs,
    job_id: JobId,
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        let mut active = self.active_jobs.lock();
        active.remove(&self.job_id);
        telemetry::set_active_jobs(active.len());
    }
}

#[derive(Default)]
struct PoolTasks {
    dispatch: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

/// One worker process: a bounded set of job tasks fed by a dispatch loop,
/// plus its heartbeat and (optionally) a recovery sweeper.
pub struct WorkerPool<S: QueueStore + 'static> {
    config: WorkerConfig,
    ledger: JobLedger<S>,
    liveness: LivenessTracker<S>,
    executor: Arc<JobExecutor<S>>,
    sweeper: Option<RecoverySweeper<S>>,
    engine: Arc<dyn ScanEngine>,
    /// Stops dispatch and aborts running jobs at their next checkpoint.
    shutdown: ShutdownToken,
    /// Stops heartbeat and sweeper once running jobs have drained.
    background: ShutdownToken,
    stopping: AtomicBool,
    active_jobs: ActiveJobs,
    tasks: Mutex<PoolTasks>,
}

impl<S: QueueStore + 'static> fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("sweeper", &self.sweeper.is_some())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl<S: QueueStore + 'static> WorkerPool<S> {
    pub(crate) fn new(
        config: WorkerConfig,
        ledger: JobLedger<S>,
        liveness: LivenessTracker<S>,
        executor: JobExecutor<S>,
        sweeper: Option<RecoverySweeper<S>>,
        engine: Arc<dyn ScanEngine>,
    ) -> Self {
        Self {
            config,
            ledger,
            liveness,
            executor: Arc::new(executor),
            sweeper,
            engine,
            shutdown: ShutdownToken::new(),
            background: ShutdownToken::new(),
            stopping: AtomicBool::new(false),
            active_jobs: Arc::new(SyncMutex::new(HashMap::new())),
            tasks: Mutex::new(PoolTasks::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown.clone()
    }

    pub async fn active_jobs(&self) -> HashMap<JobId, ActiveJob> {
        self.active_jobs.lock().clone()
    }

    pub async fn active_job_count(&self) -> usize {
        self.active_jobs.lock().len()
    }

    /// Start the heartbeat, the sweeper and the dispatch loop.
    ///
    /// The first heartbeat is written before any job is popped.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut tasks = self.tasks.lock().await;
        if tasks.dispatch.is_some() || self.stopping.load(Ordering::SeqCst) {
            anyhow::bail!("worker pool {} already started", self.config.worker_id);
        }

        self.liveness
            .heartbeat(&self.config.worker_id)
            .await
            .context("initial heartbeat failed")?;
        tasks.heartbeat = Some(
            self.liveness
                .spawn_heartbeat(self.config.worker_id.clone(), self.background.clone()),
        );

        if let Some(sweeper) = &self.sweeper {
            tasks.sweeper =
                Some(sweeper.spawn(self.config.sweep_interval(), self.background.clone()));
        }

        let dispatch = DispatchLoop {
            config: self.config.clone(),
            ledger: self.ledger.clone(),
            executor: Arc::clone(&self.executor),
            shutdown: self.shutdown.clone(),
            active_jobs: Arc::clone(&self.active_jobs),
        };
        tasks.dispatch = Some(tokio::spawn(dispatch.run()));

        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            sweeper = self.sweeper.is_some(),
            "worker pool started"
        );
        Ok(())
    }

    /// Gracefully stop the pool. A second call returns immediately.
    ///
    /// Dispatch stops after its current poll, running jobs finish their
    /// current target and are marked aborted, then heartbeat and sweeper
    /// stop and the scan engine is released.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!(worker_id = %self.config.worker_id, "shutdown already in progress");
            return Ok(());
        }
        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        self.shutdown.cancel();

        let tasks = {
            let mut guard = self.tasks.lock().await;
            std::mem::take(&mut *guard)
        };

        if let Some(dispatch) = tasks.dispatch {
            if let Err(err) = dispatch.await {
                error!("dispatch loop failed: {err}");
            }
        }

        self.background.cancel();
        for handle in [tasks.heartbeat, tasks.sweeper].into_iter().flatten() {
            if let Err(err) = handle.await {
                warn!("background task failed: {err}");
            }
        }

        if let Err(err) = self.liveness.retire(&self.config.worker_id).await {
            warn!(worker_id = %self.config.worker_id, "failed to remove heartbeat: {err:#}");
        }

        self.engine
            .shutdown()
            .await
            .context("scan engine shutdown failed")?;

        info!(worker_id = %self.config.worker_id, "worker pool shutdown complete");
        Ok(())
    }
}

struct DispatchLoop<S: QueueStore + 'static> {
    config: WorkerConfig,
    ledger: JobLedger<S>,
    executor: Arc<JobExecutor<S>>,
    shutdown: ShutdownToken,
    active_jobs: ActiveJobs,
}

impl<S: QueueStore + 'static> DispatchLoop<S> {
    async fn run(self) {
        let worker_id = self.config.worker_id.clone();
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut jobs = JoinSet::new();

        loop {
            while let Some(joined) = jobs.try_join_next() {
                log_join(joined);
            }

            // Take a permit first so nothing is popped that cannot start.
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            if self.shutdown.is_cancelled() {
                break;
            }

            // Not raced against shutdown: dropping a pop in flight could
            // lose the job.
            let popped = self
                .ledger
                .queue()
                .dequeue(self.config.poll_interval())
                .instrument(telemetry::job_dequeue_span(&worker_id))
                .await;

            let queued = match popped {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(err) => {
                    warn!(worker_id = %worker_id, "dequeue failed: {err:#}");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => continue,
                    }
                }
            };

            if self.shutdown.is_cancelled() {
                self.give_back(&queued).await;
                break;
            }

            let Some(job) = self.load_definition(&queued).await else {
                continue;
            };
            self.spawn_job(&mut jobs, job, permit);
        }

        debug!(worker_id = %worker_id, in_flight = jobs.len(), "dispatch stopped, draining jobs");
        while let Some(joined) = jobs.join_next().await {
            log_join(joined);
        }
    }

    /// The ledger copy is authoritative; a queue entry whose definition is
    /// gone was already finished or dead-lettered elsewhere.
    async fn load_definition(&self, queued: &ScanJob) -> Option<ScanJob> {
        match self.ledger.fetch_details(&queued.job_id).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                error!(job_id = %queued.job_id, "dequeued job has no ledger definition, skipping");
                None
            }
            Err(err) => {
                warn!(job_id = %queued.job_id, "failed to load job definition: {err:#}");
                self.give_back(queued).await;
                None
            }
        }
    }

    async fn give_back(&self, job: &ScanJob) {
        match self.ledger.queue().return_to_front(job).await {
            Ok(()) => debug!(job_id = %job.job_id, "returned job to queue"),
            Err(err) => {
                error!(job_id = %job.job_id, "failed to return job to queue: {err:#}")
            }
        }
    }

    fn spawn_job(
        &self,
        jobs: &mut JoinSet<()>,
        job: ScanJob,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let job_id = job.job_id.clone();
        {
            let mut active = self.active_jobs.lock();
            active.insert(
                job_id.clone(),
                ActiveJob {
                    started_at: Utc::now(),
                    targets: job.targets.len(),
                },
            );
            telemetry::set_active_jobs(active.len());
        }

        let executor = Arc::clone(&self.executor);
        let shutdown = self.shutdown.clone();
        let guard = ActiveJobGuard {
            active_jobs: Arc::clone(&self.active_jobs),
            job_id,
        };
        jobs.spawn(async move {
            let _permit = permit;
            let _guard = guard;
            executor.process_job(job, &shutdown).await;
        });
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!("job task failed: {err}");
    }
}
