//! Worker pool integration tests.
//!
//! Every test runs on a paused tokio clock, so poll timeouts, heartbeat
//! intervals and sweep intervals elapse instantly once the pool is idle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use vigil::{
    JobEventPayload, JobId, JobState, StatusUpdate, WorkerConfig, WorkerPoolBuilder,
};
use vigil_testkit::{target, MemoryQueueStore, RecordingReporter, ScriptedEngine, TestHarness};

const WAIT: Duration = Duration::from_secs(600);
const POLL: Duration = Duration::from_millis(50);

async fn wait_for_state(harness: &TestHarness, job_id: &str, state: JobState) {
    let client = harness.client();
    let id = JobId::new(job_id);
    let reached = timeout(WAIT, async {
        loop {
            let current = client.status(&id).await.unwrap().and_then(|status| status.state);
            if current == Some(state) {
                break;
            }
            sleep(POLL).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{job_id} never reached {state}");
}

async fn wait_for_scans(engine: &ScriptedEngine, count: usize) {
    let reached = timeout(WAIT, async {
        while engine.calls().len() < count {
            sleep(POLL).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "engine never saw {count} scans");
}

#[tokio::test(start_paused = true)]
async fn test_pool_runs_jobs_to_completion() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let reporter = RecordingReporter::new();
    let pool = harness
        .pool(WorkerConfig::new("w1").with_concurrency(2), &engine)
        .with_reporter(Arc::new(reporter.clone()))
        .build()
        .unwrap();

    pool.start().await.unwrap();
    assert!(harness.liveness().is_alive("w1").await.unwrap());

    for id in ["a", "b", "c"] {
        harness.submit(id, 2).await.unwrap();
    }
    for id in ["a", "b", "c"] {
        wait_for_state(&harness, id, JobState::Completed).await;
    }
    reporter.assert_posted_count_eq(6);
    assert!(reporter.posted().iter().all(|payload| payload.worker_id == "w1"));

    pool.shutdown().await.unwrap();
    assert_eq!(engine.shutdown_count(), 1);
    assert!(!harness.liveness().is_alive("w1").await.unwrap());
    assert!(harness.inflight().is_empty());
    assert_eq!(pool.active_job_count().await, 0);

    // A second shutdown is a no-op.
    pool.shutdown().await.unwrap();
    assert_eq!(engine.shutdown_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_cannot_start_twice() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let pool = harness.pool(WorkerConfig::new("w1"), &engine).build().unwrap();

    pool.start().await.unwrap();
    let err = pool.start().await.unwrap_err();
    assert!(err.to_string().contains("already started"));

    pool.shutdown().await.unwrap();
    assert!(pool.start().await.is_err());
}

#[tokio::test]
async fn test_builder_requires_engine_and_valid_config() {
    let harness = TestHarness::new();

    let err = WorkerPoolBuilder::<MemoryQueueStore>::new(WorkerConfig::new("w1"))
        .with_store(Arc::clone(&harness.store))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("engine dependency missing"));

    let err = WorkerPoolBuilder::<MemoryQueueStore>::new(WorkerConfig::new("w1"))
        .with_engine(Arc::new(ScriptedEngine::new()))
        .build()
        .unwrap_err();
    assert!(err.to_string().contains("store dependency missing"));

    let err = harness
        .pool(WorkerConfig::new("w1").with_concurrency(0), &ScriptedEngine::new())
        .build()
        .unwrap_err();
    assert_eq!(err.to_string(), "worker concurrency must be at least 1");
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_mid_job_aborts_after_current_target() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(2));
    let pool = Arc::new(harness.pool(WorkerConfig::new("w1"), &engine).build().unwrap());
    pool.start().await.unwrap();

    harness.submit("j3", 3).await.unwrap();
    engine.wait_for_scan(&target(2)).await;
    assert_eq!(pool.active_job_count().await, 1);

    let stopping = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.shutdown().await })
    };
    pool.shutdown_token().cancelled().await;
    engine.release();
    stopping.await.unwrap().unwrap();

    let id = JobId::new("j3");
    let ledger = harness.ledger();
    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::Aborted));
    assert_eq!(status.progress.as_deref(), Some("2/3"));
    assert_eq!(engine.calls_for(&target(3)), 0);

    let job = ledger.fetch_details(&id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(harness.queued_ids().is_empty());
    assert!(harness.inflight().is_empty());
    assert!(!harness.liveness().is_alive("w1").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_leaves_unstarted_jobs_queued() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(1));
    let pool = Arc::new(
        harness
            .pool(WorkerConfig::new("w1").with_concurrency(1), &engine)
            .build()
            .unwrap(),
    );
    pool.start().await.unwrap();

    harness.submit("first", 1).await.unwrap();
    engine.wait_for_scan(&target(1)).await;
    harness.submit("second", 1).await.unwrap();

    let stopping = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.shutdown().await })
    };
    pool.shutdown_token().cancelled().await;
    engine.release();
    stopping.await.unwrap().unwrap();

    // The running target was allowed to finish, which finished the job.
    wait_for_state(&harness, "first", JobState::Completed).await;
    wait_for_state(&harness, "second", JobState::Queued).await;
    assert_eq!(harness.queued_ids(), vec!["second"]);
    engine.assert_scan_count_eq(1);
}

#[tokio::test(start_paused = true)]
async fn test_pool_respects_concurrency_bound() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(1));
    let pool = harness
        .pool(WorkerConfig::new("w1").with_concurrency(2), &engine)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    for id in ["a", "b", "c", "d"] {
        harness.submit(id, 1).await.unwrap();
    }
    wait_for_scans(&engine, 2).await;
    sleep(Duration::from_secs(20)).await;

    engine.assert_scan_count_eq(2);
    assert_eq!(pool.active_job_count().await, 2);
    assert_eq!(harness.client().queue_depth().await.unwrap(), 2);
    assert_eq!(harness.inflight().len(), 2);

    engine.release();
    for id in ["a", "b", "c", "d"] {
        wait_for_state(&harness, id, JobState::Completed).await;
    }
    engine.assert_scan_count_eq(4);
    pool.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pool_dead_letters_persistently_failing_job() {
    let harness = TestHarness::new().with_max_retries(1);
    let engine = ScriptedEngine::new();
    engine.fail_all("scanner crashed");
    let pool = harness.pool(WorkerConfig::new("w1"), &engine).build().unwrap();
    pool.start().await.unwrap();

    harness.submit("bad", 1).await.unwrap();
    wait_for_state(&harness, "bad", JobState::DeadLetter).await;

    let dead = harness.client().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.retry_count, 2);
    assert_eq!(engine.calls_for(&target(1)), 2);
    assert!(harness.queued_ids().is_empty());
    assert!(harness.inflight().is_empty());

    pool.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_engine_does_not_strand_job() {
    let harness = TestHarness::new().with_max_retries(1);
    let engine = ScriptedEngine::new();
    engine.panic_target(&target(1));
    let pool = harness.pool(WorkerConfig::new("w1"), &engine).build().unwrap();
    pool.start().await.unwrap();

    harness.submit("jp", 1).await.unwrap();
    wait_for_state(&harness, "jp", JobState::DeadLetter).await;

    let dead = harness.client().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].dlq_reason.contains("panicked"));
    assert_eq!(engine.calls_for(&target(1)), 2);
    assert!(harness.inflight().is_empty());
    assert_eq!(pool.active_job_count().await, 0);

    pool.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_live_pool_recovers_and_runs_orphan() {
    let harness = TestHarness::new();
    let ledger = harness.ledger();
    let id = JobId::new("orphan");

    // A worker popped the job, started it and died without a heartbeat.
    harness.submit("orphan", 2).await.unwrap();
    ledger.queue().dequeue(Duration::from_secs(1)).await.unwrap();
    ledger.set_inflight(&id, "w-dead").await.unwrap();
    ledger
        .update_status(&id, StatusUpdate::state(JobState::Running).worker("w-dead"))
        .await
        .unwrap();

    let mut events = harness.events.subscribe();
    let engine = ScriptedEngine::new();
    let pool = harness
        .pool(WorkerConfig::new("w-b").with_sweep_interval(1), &engine)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    wait_for_state(&harness, "orphan", JobState::Completed).await;
    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.worker_id.as_deref(), Some("w-b"));
    assert!(harness.inflight().is_empty());
    pool.shutdown().await.unwrap();

    let mut recovered = Vec::new();
    let mut started_retry = None;
    while let Ok(event) = events.try_recv() {
        match event.payload {
            JobEventPayload::Recovered { dead_worker, .. } => recovered.push(dead_worker),
            JobEventPayload::Started { retry_count, .. } => started_retry = Some(retry_count),
            _ => {}
        }
    }
    assert_eq!(recovered, vec!["w-dead".to_string()]);
    assert_eq!(started_retry, Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_stale_queue_entry_for_finished_job_is_skipped() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let job = harness.submit("dup", 1).await.unwrap();
    // A duplicate left behind by an at-least-once requeue.
    harness.ledger().queue().enqueue(&job).await.unwrap();

    let pool = harness
        .pool(WorkerConfig::new("w1").with_concurrency(1), &engine)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    wait_for_state(&harness, "dup", JobState::Completed).await;
    let drained = timeout(WAIT, async {
        while !harness.queued_ids().is_empty() {
            sleep(POLL).await;
        }
    })
    .await;
    assert!(drained.is_ok());
    sleep(Duration::from_secs(1)).await;

    engine.assert_scan_count_eq(1);
    pool.shutdown().await.unwrap();
}
