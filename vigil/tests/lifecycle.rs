//! Job lifecycle tests against the in-memory store.
//!
//! Covers submission, execution to completion, the shared failure path,
//! dead-lettering, timeouts and shutdown-driven aborts, driving a single
//! executor by hand.

use std::sync::Arc;
use std::time::Duration;

use vigil::{
    FailureOutcome, JobEventPayload, JobExecutor, JobId, JobOptions, JobOutcome, JobState,
    QueueStore, ShutdownToken, StatusUpdate,
};
use vigil_testkit::{
    scan_job, scan_request, scan_request_with_unknown_option, target, MemoryQueueStore,
    RecordingReporter, ScriptedEngine, TestHarness,
};

/// Pop the next job the way the dispatch loop does and run it to the end.
async fn run_next(
    harness: &TestHarness,
    executor: &JobExecutor<MemoryQueueStore>,
) -> JobOutcome {
    let ledger = harness.ledger();
    let queued = ledger
        .queue()
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a queued job");
    let job = ledger
        .fetch_details(&queued.job_id)
        .await
        .unwrap()
        .expect("ledger definition");
    executor.process_job(job, &ShutdownToken::new()).await
}

#[tokio::test]
async fn test_successful_job_is_purged_from_ledger() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let reporter = RecordingReporter::new();
    let executor = harness.executor("w1", &engine, &reporter);
    let id = JobId::new("j-ok");

    harness.submit("j-ok", 3).await.unwrap();
    assert_eq!(run_next(&harness, &executor).await, JobOutcome::Completed);

    let ledger = harness.ledger();
    assert!(ledger.fetch_details(&id).await.unwrap().is_none());
    assert!(harness.inflight().is_empty());
    assert!(harness.queued_ids().is_empty());

    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::Completed));
    assert_eq!(status.progress.as_deref(), Some("3/3"));
    assert_eq!(status.worker_id.as_deref(), Some("w1"));
    assert!(status.started_at.is_some());
    assert!(status.finished_at.is_some());

    let results = ledger.results(&id).await.unwrap();
    assert_eq!(results.len(), 3);
    engine.assert_scan_count_eq(3);

    reporter.assert_posted_count_eq(3);
    let posted = reporter.posted();
    assert_eq!(posted[0].target, target(1));
    assert_eq!(posted[2].target, target(3));
    assert_eq!(posted[0].config_name, "testkit");
    assert_eq!(posted[0].report_location, results[0]);
}

#[tokio::test]
async fn test_job_dead_lettered_after_exhausting_retries() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.fail_all("connection refused");
    let reporter = RecordingReporter::new();
    let executor = harness.executor("w1", &engine, &reporter);
    let id = JobId::new("j-doomed");

    harness.submit("j-doomed", 2).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..4 {
        outcomes.push(run_next(&harness, &executor).await);
    }
    assert_eq!(
        outcomes,
        vec![
            JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 1 }),
            JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 2 }),
            JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 3 }),
            JobOutcome::Failed(FailureOutcome::DeadLettered { retry_count: 4 }),
        ]
    );

    let dead = harness.client().dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].job.job_id, id);
    assert_eq!(dead[0].job.retry_count, 4);
    assert_eq!(
        dead[0].job.last_error.as_deref(),
        Some("scan engine failed: connection refused")
    );
    assert_eq!(
        dead[0].dlq_reason,
        "exceeded 3 retries; last error: scan engine failed: connection refused"
    );

    let ledger = harness.ledger();
    assert!(ledger.fetch_details(&id).await.unwrap().is_none());
    assert!(harness.inflight().is_empty());
    assert!(harness.queued_ids().is_empty());

    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::DeadLetter));
    assert_eq!(status.dlq_reason.as_deref(), Some(dead[0].dlq_reason.as_str()));
    assert!(status.finished_at.is_some());
}

#[tokio::test]
async fn test_retry_keeps_definition_and_requeues_once() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.fail_target_times(&target(2), 1, "reset by peer");
    let executor = harness.executor("w1", &engine, &RecordingReporter::new());
    let id = JobId::new("j-flaky");

    harness.submit("j-flaky", 2).await.unwrap();
    assert_eq!(
        run_next(&harness, &executor).await,
        JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 1 })
    );

    let ledger = harness.ledger();
    let job = ledger.fetch_details(&id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.last_error.as_deref(), Some("scan engine failed: reset by peer"));
    assert_eq!(harness.queued_ids(), vec!["j-flaky"]);
    assert!(harness.inflight().is_empty());

    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::RetryQueued));
    assert_eq!(status.error.as_deref(), Some("scan engine failed: reset by peer"));

    // The retry starts from the first target again.
    assert_eq!(run_next(&harness, &executor).await, JobOutcome::Completed);
    assert_eq!(
        engine.calls(),
        vec![target(1), target(2), target(1), target(2)]
    );
}

#[tokio::test]
async fn test_inflight_tracks_running_state() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(1));
    let executor = Arc::new(harness.executor("w1", &engine, &RecordingReporter::new()));
    let id = JobId::new("j-run");

    let job = harness.submit("j-run", 1).await.unwrap();
    let ledger = harness.ledger();
    assert!(harness.inflight().is_empty());
    assert_eq!(
        ledger.status(&id).await.unwrap().unwrap().state,
        Some(JobState::Queued)
    );

    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.process_job(job, &ShutdownToken::new()).await })
    };
    engine.wait_for_scan(&target(1)).await;

    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::Running));
    assert_eq!(status.current_target, Some(target(1)));
    assert_eq!(status.progress.as_deref(), Some("1/1"));
    assert_eq!(harness.inflight().get("j-run").map(String::as_str), Some("w1"));

    let active = harness.client().active_jobs().await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].job_id, id);

    engine.release();
    assert_eq!(running.await.unwrap(), JobOutcome::Completed);
    assert!(harness.inflight().is_empty());
    assert!(harness.client().active_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_between_targets_aborts_without_retry() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(2));
    let executor = Arc::new(harness.executor("w1", &engine, &RecordingReporter::new()));
    let shutdown = ShutdownToken::new();
    let id = JobId::new("j-long");

    let job = harness.submit("j-long", 3).await.unwrap();
    let running = {
        let executor = Arc::clone(&executor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { executor.process_job(job, &shutdown).await })
    };

    engine.wait_for_scan(&target(2)).await;
    shutdown.cancel();
    engine.release();

    assert_eq!(running.await.unwrap(), JobOutcome::Aborted { completed: 2 });
    assert_eq!(engine.calls_for(&target(3)), 0);

    let ledger = harness.ledger();
    let status = ledger.status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::Aborted));
    assert_eq!(status.progress.as_deref(), Some("2/3"));
    assert!(status.finished_at.is_some());
    assert_eq!(ledger.results(&id).await.unwrap().len(), 2);

    // Aborts are not failures: nothing is requeued and no retry is spent.
    let job = ledger.fetch_details(&id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 0);
    assert!(harness.queued_ids().is_empty());
    assert!(harness.inflight().is_empty());
    assert!(harness.client().dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_resume_aborted_requeues_once() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let executor = harness.executor("w1", &engine, &RecordingReporter::new());
    let client = harness.client();
    let id = JobId::new("j-resume");

    let job = harness.submit("j-resume", 2).await.unwrap();
    harness.ledger().queue().dequeue(Duration::from_secs(1)).await.unwrap();

    let stopped = ShutdownToken::new();
    stopped.cancel();
    assert_eq!(
        executor.process_job(job, &stopped).await,
        JobOutcome::Aborted { completed: 0 }
    );

    assert!(client.resume_aborted(&id).await.unwrap());
    assert_eq!(harness.queued_ids(), vec!["j-resume"]);
    assert_eq!(
        client.status(&id).await.unwrap().unwrap().state,
        Some(JobState::Queued)
    );

    // No longer aborted, so a second resume is refused.
    assert!(!client.resume_aborted(&id).await.unwrap());
    assert_eq!(harness.queued_ids().len(), 1);

    assert_eq!(run_next(&harness, &executor).await, JobOutcome::Completed);
}

#[tokio::test]
async fn test_resume_refuses_unknown_or_running_jobs() {
    let harness = TestHarness::new();
    let client = harness.client();

    assert!(!client.resume_aborted(&JobId::new("nope")).await.unwrap());

    harness.submit("j-queued", 1).await.unwrap();
    assert!(!client.resume_aborted(&JobId::new("j-queued")).await.unwrap());
    assert_eq!(harness.queued_ids().len(), 1);
}

#[tokio::test]
async fn test_resume_ignores_aborted_status_projection() {
    let harness = TestHarness::new();
    let client = harness.client();
    let ledger = harness.ledger();
    let id = JobId::new("j-stale");

    harness.submit("j-stale", 1).await.unwrap();
    harness.ledger().queue().dequeue(Duration::from_secs(1)).await.unwrap();
    ledger
        .update_status(&id, StatusUpdate::state(JobState::Aborted))
        .await
        .unwrap();

    // The projection says aborted but nothing recorded an abort.
    assert!(!client.resume_aborted(&id).await.unwrap());

    // Recorded abort, but another worker owns the job again.
    ledger.mark_aborted(&id, "w1").await.unwrap();
    ledger.set_inflight(&id, "w2").await.unwrap();
    assert!(!client.resume_aborted(&id).await.unwrap());
    assert!(harness.queued_ids().is_empty());
    assert_eq!(harness.inflight().get("j-stale").map(String::as_str), Some("w2"));
}

#[tokio::test(start_paused = true)]
async fn test_target_overrunning_max_duration_is_a_failure() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.delay_target(&target(1), Duration::from_secs(10));
    let executor = harness.executor("w1", &engine, &RecordingReporter::new());
    let id = JobId::new("j-slow");

    let request = scan_request("j-slow", 1)
        .with_options(JobOptions::default().with_max_duration(5));
    harness.client().submit(request).await.unwrap();

    assert_eq!(
        run_next(&harness, &executor).await,
        JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 1 })
    );
    let status = harness.ledger().status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::RetryQueued));
    assert_eq!(
        status.error.as_deref(),
        Some("scan of https://target-1.test exceeded 5s")
    );
}

#[tokio::test]
async fn test_reporter_failures_do_not_fail_the_job() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let reporter = RecordingReporter::failing();
    let executor = harness.executor("w1", &engine, &reporter);

    harness.submit("j-report", 2).await.unwrap();
    assert_eq!(run_next(&harness, &executor).await, JobOutcome::Completed);
    reporter.assert_posted_count_eq(2);
}

#[tokio::test]
async fn test_failure_without_definition_changes_nothing() {
    let harness = TestHarness::new();
    let ledger = harness.ledger();
    let id = JobId::new("ghost");
    ledger.set_inflight(&id, "w1").await.unwrap();

    let outcome = harness
        .failures()
        .handle_failure(&id, "boom")
        .await
        .unwrap();
    assert_eq!(outcome, FailureOutcome::MissingDefinition);
    assert_eq!(harness.inflight().get("ghost").map(String::as_str), Some("w1"));
    assert!(harness.queued_ids().is_empty());
    assert!(harness.client().dead_letters().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_only_when_shutdown_interrupts_recording() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let executor = Arc::new(harness.executor("w1", &engine, &RecordingReporter::new()));
    let shutdown = ShutdownToken::new();

    let job = harness.submit("j-down", 1).await.unwrap();
    harness.store.set_unavailable(true);
    let running = {
        let executor = Arc::clone(&executor);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { executor.process_job(job, &shutdown).await })
    };

    // Recording keeps retrying while the worker is healthy.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(!running.is_finished());

    shutdown.cancel();
    assert_eq!(running.await.unwrap(), JobOutcome::Unresolved);
    engine.assert_scan_count_eq(0);
}

#[tokio::test(start_paused = true)]
async fn test_failure_recorded_after_store_outage() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.hold_target(&target(1));
    let executor = Arc::new(harness.executor("w1", &engine, &RecordingReporter::new()));
    let id = JobId::new("j-outage");

    harness.submit("j-outage", 1).await.unwrap();
    let job = harness
        .ledger()
        .queue()
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let running = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.process_job(job, &ShutdownToken::new()).await })
    };

    engine.wait_for_scan(&target(1)).await;
    harness.store.set_unavailable(true);
    engine.release();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!running.is_finished());

    harness.store.set_unavailable(false);
    assert_eq!(
        running.await.unwrap(),
        JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 1 })
    );
    assert_eq!(harness.queued_ids(), vec!["j-outage"]);
    assert!(harness.inflight().is_empty());
    let job = harness.ledger().fetch_details(&id).await.unwrap().unwrap();
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn test_panicking_engine_is_a_failure() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    engine.panic_target(&target(1));
    let executor = harness.executor("w1", &engine, &RecordingReporter::new());
    let id = JobId::new("j-panic");

    harness.submit("j-panic", 1).await.unwrap();
    assert_eq!(
        run_next(&harness, &executor).await,
        JobOutcome::Failed(FailureOutcome::Requeued { retry_count: 1 })
    );

    let status = harness.ledger().status(&id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::RetryQueued));
    assert_eq!(
        status.error.as_deref(),
        Some("scan engine failed: panicked: scanner crashed on https://target-1.test")
    );
    assert!(harness.inflight().is_empty());
    assert_eq!(harness.queued_ids(), vec!["j-panic"]);
}

#[tokio::test]
async fn test_reporter_panics_do_not_fail_the_job() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let reporter = RecordingReporter::panicking();
    let executor = harness.executor("w1", &engine, &reporter);

    harness.submit("j-report-panic", 2).await.unwrap();
    assert_eq!(run_next(&harness, &executor).await, JobOutcome::Completed);
    reporter.assert_posted_count_eq(2);
}

#[tokio::test]
async fn test_undecodable_queue_entry_is_dropped() {
    let harness = TestHarness::new();
    harness
        .store
        .lpush(&harness.keys.jobs(), "{not a job")
        .await
        .unwrap();

    let popped = harness
        .ledger()
        .queue()
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap();
    assert!(popped.is_none());
    assert!(harness.queued_ids().is_empty());
}

#[tokio::test]
async fn test_ledger_submit_keeps_given_retry_count() {
    let harness = TestHarness::new();
    let ledger = harness.ledger();
    let mut job = scan_job("j-carried", 1);
    job.retry_count = 2;

    ledger.submit(job).await.unwrap();
    let stored = ledger
        .fetch_details(&JobId::new("j-carried"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.retry_count, 2);
}

#[tokio::test]
async fn test_submit_strips_unknown_options() {
    let harness = TestHarness::new();
    let client = harness.client();

    let job = client
        .submit(scan_request_with_unknown_option("j-opts", 1))
        .await
        .unwrap();
    assert!(job.options.unrecognized_keys().is_empty());
    assert_eq!(job.options.max_duration_secs, Some(120));

    let raw = harness
        .store
        .hash(&harness.keys.job_details())
        .remove("j-opts")
        .unwrap();
    assert!(!raw.contains("crawl_depth"));
    assert!(harness.store.list(&harness.keys.jobs())[0].contains("\"max_duration_secs\":120"));
}

#[tokio::test]
async fn test_submit_generates_id_and_announces_job() {
    let harness = TestHarness::new();
    let mut events = harness.events.subscribe();

    let job = harness
        .client()
        .submit(vigil::NewScanJob::new(vec![target(1), target(2)]))
        .await
        .unwrap();
    assert!(!job.job_id.as_str().is_empty());
    assert_eq!(job.config_name, "unnamed");
    assert_eq!(job.retry_count, 0);

    let event = events.try_recv().unwrap();
    assert_eq!(event.job_id(), &job.job_id);
    assert!(matches!(
        event.payload,
        JobEventPayload::Submitted { targets: 2, .. }
    ));

    let status = harness.client().status(&job.job_id).await.unwrap().unwrap();
    assert_eq!(status.state, Some(JobState::Queued));
    assert_eq!(status.progress.as_deref(), Some("0/2"));
    assert!(status.last_updated.is_some());
}

#[tokio::test]
async fn test_executor_emits_lifecycle_events() {
    let harness = TestHarness::new();
    let engine = ScriptedEngine::new();
    let executor = harness.executor("w1", &engine, &RecordingReporter::new());

    harness.submit("j-events", 2).await.unwrap();
    let mut events = harness.events.subscribe();
    run_next(&harness, &executor).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.meta.worker_id.as_deref(), Some("w1"));
        kinds.push(match event.payload {
            JobEventPayload::Started { .. } => "started",
            JobEventPayload::TargetFinished { .. } => "target",
            JobEventPayload::Completed { .. } => "completed",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["started", "target", "target", "completed"]);
}

#[tokio::test]
async fn test_snapshot_counts_queue_and_owners() {
    let harness = TestHarness::new();
    let client = harness.client();
    let ledger = harness.ledger();

    for id in ["a", "b", "c"] {
        harness.submit(id, 1).await.unwrap();
    }
    let popped = ledger
        .queue()
        .dequeue(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(popped.job_id.as_str(), "a");
    ledger.set_inflight(&popped.job_id, "w1").await.unwrap();

    assert_eq!(client.queue_depth().await.unwrap(), 2);
    let snapshot = client.snapshot().await.unwrap();
    assert_eq!(snapshot.queue, "scan:jobs");
    assert_eq!(snapshot.ready_count, 2);
    assert_eq!(snapshot.inflight_count, 1);
    assert_eq!(snapshot.total_count(), 3);
}
