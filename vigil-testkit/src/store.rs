use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use vigil::QueueStore;

/// In-memory [`QueueStore`] with Redis list/hash/expiring-key semantics.
///
/// Expiry runs on the tokio clock, so tests can drive heartbeat expiry with
/// `tokio::time::pause` and `advance`.
#[derive(Clone, Default)]
pub struct MemoryQueueStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    unavailable: AtomicBool,
}

#[derive(Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    strings: HashMap<String, Expiring>,
}

struct Expiring {
    value: String,
    expires_at: Instant,
}

impl State {
    fn live_string(&mut self, key: &str) -> Option<&Expiring> {
        let expired = self
            .strings
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now());
        if expired {
            self.strings.remove(key);
        }
        self.strings.get(key)
    }
}

impl std::fmt::Debug for MemoryQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryQueueStore")
            .field("hashes", &state.hashes.len())
            .field("lists", &state.lists.len())
            .field("strings", &state.strings.len())
            .finish()
    }
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Drop a string key immediately, as if its ttl had run out.
    pub fn expire(&self, key: &str) -> bool {
        self.inner.state.lock().strings.remove(key).is_some()
    }

    /// Contents of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .lists
            .get(key)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn hash(&self, key: &str) -> HashMap<String, String> {
        self.inner
            .state
            .lock()
            .hashes
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Value of a live string key.
    pub fn string(&self, key: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .live_string(key)
            .map(|entry| entry.value.clone())
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("memory store unavailable");
        }
        Ok(())
    }

    fn try_pop_back(&self, key: &str) -> Option<String> {
        let mut state = self.inner.state.lock();
        let list = state.lists.get_mut(key)?;
        let value = list.pop_back();
        if list.is_empty() {
            state.lists.remove(key);
        }
        value
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner
            .state
            .lock()
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> anyhow::Result<()> {
        self.check()?;
        if fields.is_empty() {
            return Ok(());
        }
        let mut state = self.inner.state.lock();
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        self.check()?;
        Ok(self
            .inner
            .state
            .lock()
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        self.check()?;
        Ok(self.hash(key))
    }

    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool> {
        self.check()?;
        let mut state = self.inner.state.lock();
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner
            .state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check()?;
        self.inner
            .state
            .lock()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn brpop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<String>> {
        self.check()?;
        let deadline = Instant::now() + timeout;
        loop {
            let pushed = self.inner.pushed.notified();
            tokio::pin!(pushed);
            pushed.as_mut().enable();

            if let Some(value) = self.try_pop_back(key) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, pushed).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lrange(&self, key: &str) -> anyhow::Result<Vec<String>> {
        self.check()?;
        Ok(self.list(key))
    }

    async fn llen(&self, key: &str) -> anyhow::Result<usize> {
        self.check()?;
        Ok(self
            .inner
            .state
            .lock()
            .lists
            .get(key)
            .map_or(0, VecDeque::len))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.check()?;
        self.inner.state.lock().strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        self.check()?;
        let mut state = self.inner.state.lock();
        if state.live_string(key).is_some() {
            return Ok(false);
        }
        state.strings.insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        self.check()?;
        let mut state = self.inner.state.lock();
        Ok(state.live_string(key).is_some()
            || state.hashes.contains_key(key)
            || state.lists.contains_key(key))
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        self.check()?;
        let mut state = self.inner.state.lock();
        let string = state.strings.remove(key).is_some();
        let hash = state.hashes.remove(key).is_some();
        let list = state.lists.remove(key).is_some();
        Ok(string || hash || list)
    }
}
