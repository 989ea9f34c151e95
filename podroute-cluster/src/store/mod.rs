//! Shared coordination store
//!
//! Leases, registry hashes and notifications all go through
//! [`CoordinationStore`]. `RedisStore` coordinates a fleet of instances;
//! `MemoryStore` keeps everything inside one process (standalone mode, tests).

mod memory;
mod redis_store;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// A message received from a subscribed channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: String,
}

/// Messages of a live subscription; the stream ends when the connection drops
pub type MessageStream = BoxStream<'static, StoreMessage>;

/// Key/value, hash and pub/sub operations used for coordination
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Set `key` to `value` with a TTL unless it already exists.
    /// Returns true if the key was created.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Reset the TTL of `key` only while it still holds `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` only while it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a subscription to the given channels
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream>;
}

/// TTLs are applied with second granularity, never below one second
pub(crate) fn ttl_seconds(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
