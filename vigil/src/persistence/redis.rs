use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::store::QueueStore;

/// Redis-backed implementation of the queue store.
///
/// Blocking pops run on their own connection: a `BRPOP` parked on the shared
/// multiplexed connection would hold up every status write queued behind it.
#[derive(Clone)]
pub struct RedisQueueStore {
    conn: ConnectionManager,
    blocking: ConnectionManager,
}

impl std::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueueStore").finish_non_exhaustive()
    }
}

impl RedisQueueStore {
    /// Connect to Redis and verify the connection with a `PING`.
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = Client::open(redis_url)
            .context("Failed to create Redis client")?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;
        let blocking = ConnectionManager::new(client)
            .await
            .context("Failed to open blocking Redis connection")?;

        let _: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Failed to ping Redis")?;

        debug!("connected queue store to {redis_url}");
        Ok(Self { conn, blocking })
    }

    fn expiry_millis(ttl: Duration) -> u64 {
        u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset(key, field, value)
            .await
            .with_context(|| format!("HSET {key} {field}"))?;
        Ok(())
    }

    async fn hset_multiple(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> anyhow::Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(key, fields)
            .await
            .with_context(|| format!("HSET {key} ({} fields)", fields.len()))?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn
            .hget(key, field)
            .await
            .with_context(|| format!("HGET {key} {field}"))?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        let map: HashMap<String, String> = conn
            .hgetall(key)
            .await
            .with_context(|| format!("HGETALL {key}"))?;
        Ok(map)
    }

    async fn hdel(&self, key: &str, field: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .hdel(key, field)
            .await
            .with_context(|| format!("HDEL {key} {field}"))?;
        Ok(removed > 0)
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .lpush(key, value)
            .await
            .with_context(|| format!("LPUSH {key}"))?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .rpush(key, value)
            .await
            .with_context(|| format!("RPUSH {key}"))?;
        Ok(())
    }

    async fn brpop(
        &self,
        key: &str,
        timeout: Duration,
    ) -> anyhow::Result<Option<String>> {
        // Whole seconds keep older servers happy; zero would block forever.
        let timeout_secs = timeout.as_secs().max(1);
        let mut conn = self.blocking.clone();
        let result: Option<(String, String)> = ::redis::cmd("BRPOP")
            .arg(key)
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("BRPOP {key}"))?;
        Ok(result.map(|(_, value)| value))
    }

    async fn lrange(&self, key: &str) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn
            .lrange(key, 0, -1)
            .await
            .with_context(|| format!("LRANGE {key}"))?;
        Ok(values)
    }

    async fn llen(&self, key: &str) -> anyhow::Result<usize> {
        let mut conn = self.conn.clone();
        let len: usize = conn
            .llen(key)
            .await
            .with_context(|| format!("LLEN {key}"))?;
        Ok(len)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::expiry_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET {key} PX"))?;
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(Self::expiry_millis(ttl))
            .query_async(&mut conn)
            .await
            .with_context(|| format!("SET {key} NX PX"))?;
        Ok(reply.is_some())
    }

    async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn
            .exists(key)
            .await
            .with_context(|| format!("EXISTS {key}"))?;
        Ok(found)
    }

    async fn del(&self, key: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .with_context(|| format!("DEL {key}"))?;
        Ok(removed > 0)
    }
}
