use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{KeySpace, LivenessConfig};
use crate::runtime::ShutdownToken;
use crate::store::QueueStore;

/// Expiring per-worker heartbeat keys.
///
/// A worker is alive exactly while its key exists. Expiry is the only death
/// signal, so a stalled but running worker can be declared dead and see its
/// job executed a second time elsewhere.
pub struct LivenessTracker<S: QueueStore> {
    store: Arc<S>,
    keys: KeySpace,
    config: LivenessConfig,
}

impl<S: QueueStore> Clone for LivenessTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: QueueStore + 'static> LivenessTracker<S> {
    pub fn new(store: Arc<S>, keys: KeySpace, config: LivenessConfig) -> Self {
        Self {
            store,
            keys,
            config,
        }
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    /// Refresh `worker_id`'s heartbeat for another ttl.
    pub async fn heartbeat(&self, worker_id: &str) -> anyhow::Result<()> {
        self.store
            .set_ex(
                &self.keys.heartbeat(worker_id),
                &Utc::now().to_rfc3339(),
                self.config.ttl(),
            )
            .await
    }

    pub async fn is_alive(&self, worker_id: &str) -> anyhow::Result<bool> {
        self.store.exists(&self.keys.heartbeat(worker_id)).await
    }

    /// Remove the heartbeat on clean exit so peers need not wait for expiry.
    pub async fn retire(&self, worker_id: &str) -> anyhow::Result<()> {
        self.store.del(&self.keys.heartbeat(worker_id)).await?;
        Ok(())
    }

    /// Beat immediately, then once per interval until `stop` fires.
    ///
    /// A failed refresh is logged and retried on the next tick.
    pub fn spawn_heartbeat(
        &self,
        worker_id: impl Into<String>,
        stop: ShutdownToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        let worker_id = worker_id.into();
        let interval = self.config.interval();

        tokio::spawn(async move {
            loop {
                match tracker.heartbeat(&worker_id).await {
                    Ok(()) => debug!(worker_id = %worker_id, "heartbeat refreshed"),
                    Err(err) => {
                        warn!(worker_id = %worker_id, "heartbeat refresh failed: {err:#}")
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => {
                        debug!(worker_id = %worker_id, "heartbeat stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        })
    }
}
