//! Worker process backed by Redis.
//!
//! Reads its configuration from the environment (`REDIS_URL`, `WORKER_ID`,
//! `MAX_WORKERS`, `MAX_RETRIES`, ...), submits a couple of demo jobs, and
//! runs until Ctrl-C, then drains gracefully.
//!
//! ```text
//! REDIS_URL=redis://localhost:6379/0 cargo run --example redis_worker --features redis
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use vigil::persistence::RedisQueueStore;
use vigil::*;

/// Engine that pretends to scan each target for a couple of seconds.
struct DemoEngine;

#[async_trait]
impl ScanEngine for DemoEngine {
    async fn run_target_scan(
        &self,
        target: &str,
        max_duration: Duration,
    ) -> Result<ReportArtifact, ScanError> {
        println!("[ENGINE] scanning {target} (limit {}s)", max_duration.as_secs());
        tokio::time::sleep(Duration::from_secs(2)).await;

        if target.contains("unreachable") {
            return Err(ScanError::Engine(format!("{target} refused connection")));
        }
        let slug: String = target
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        Ok(ReportArtifact::new(format!("reports/{slug}.html")).with_findings(
            FindingSummary {
                high: 0,
                medium: 1,
                low: 3,
                informational: 7,
            },
        ))
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        println!("[ENGINE] released");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = VigilConfig::from_env()?;
    println!(
        "Starting worker {} against {} (concurrency {})",
        config.worker.worker_id, config.redis_url, config.worker.concurrency
    );

    let store = Arc::new(RedisQueueStore::connect(&config.redis_url).await?);
    let events = Arc::new(InProcEventBus::default());

    let client = JobClient::from_config(Arc::clone(&store), &config).with_events(Arc::clone(&events));
    let pool = WorkerPoolBuilder::from_config(&config)
        .with_store(Arc::clone(&store))
        .with_engine(Arc::new(DemoEngine))
        .with_events(Arc::clone(&events))
        .build()?;

    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            println!("[EVENT] {} {:?}", event.job_id(), event.payload);
        }
    });

    pool.start().await?;

    for targets in [
        vec!["https://example.test".to_string(), "https://api.example.test".to_string()],
        vec!["https://unreachable.test".to_string()],
    ] {
        let job = client
            .submit(NewScanJob::new(targets).with_config_name("demo"))
            .await?;
        println!("Submitted job {}", job.job_id);
    }

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    pool.shutdown().await?;

    let snapshot = client.snapshot().await?;
    println!(
        "Queue {}: {} ready, {} in flight, {} dead-lettered",
        snapshot.queue,
        snapshot.ready_count,
        snapshot.inflight_count,
        client.dead_letters().await?.len()
    );
    Ok(())
}
