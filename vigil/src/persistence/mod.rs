/// Redis-backed implementation of the queue store.
///
/// This module provides `RedisQueueStore`, the production
/// implementation of the [`QueueStore`](crate::store::QueueStore) trait.
pub mod redis;

pub use self::redis::RedisQueueStore;
