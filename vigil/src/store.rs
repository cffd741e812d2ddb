use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

/// Trait for the shared store every coordination primitive is built on.
///
/// The operations mirror a Redis-style list/hash/expiring-key store. Each call
/// is atomic on its own; sequences of calls are not, so callers order their
/// writes such that a crash part-way duplicates work rather than losing it.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Set a single hash field.
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;

    /// Set several hash fields at once.
    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> anyhow::Result<()>;

    /// Read a hash field.
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;

    /// Read a whole hash. Missing keys read as an empty map.
    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>>;

    /// Remove a hash field, returning whether it existed.
    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool>;

    /// Push onto the head of a list.
    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Push onto the tail of a list.
    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Pop from the tail of a list, waiting up to `timeout` for an element.
    async fn brpop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<String>>;

    /// Read a whole list, head first.
    async fn lrange(&self, key: &str) -> anyhow::Result<Vec<String>>;

    async fn llen(&self, key: &str) -> anyhow::Result<usize>;

    /// Set a string value that expires after `ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;

    /// Set an expiring string value only if the key is absent.
    ///
    /// Returns `true` when this call created the key.
    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    async fn exists(&self, key: &str) -> anyhow::Result<bool>;

    /// Delete a key of any type, returning whether it existed.
    async fn del(&self, key: &str) -> anyhow::Result<bool>;
}
