use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{Client as RedisClient, RedisResult, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{ttl_seconds, CoordinationStore, MessageStream, StoreMessage};
use crate::error::{Error, Result};

const COMPARE_AND_EXPIRE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Redis-backed coordination store
///
/// Commands share one auto-reconnecting connection; each subscription gets its
/// own pub/sub connection. Every call is bounded by `op_timeout`.
#[derive(Clone)]
pub struct RedisStore {
    client: RedisClient,
    connection: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect to `url`, failing fast if Redis cannot be reached
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = RedisClient::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let connection = timeout(op_timeout, client.get_connection_manager())
            .await
            .map_err(|_| Error::Timeout("Redis connection timed out".to_string()))?
            .map_err(|e| Error::Store(format!("Failed to connect to Redis: {e}")))?;

        debug!("Redis coordination store connected");

        Ok(Self {
            client,
            connection,
            op_timeout,
        })
    }

    async fn run<T>(&self, op: &str, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
        timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("Redis {op} timed out")))?
            .map_err(|e| Error::Store(format!("Redis {op} failed: {e}")))
    }
}

#[async_trait]
impl CoordinationStore for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = self
            .run(
                "SET NX",
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl_seconds(ttl))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value = self
            .run("GET", redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let script = Script::new(COMPARE_AND_EXPIRE);
        let mut invocation = script.key(key);
        invocation.arg(expected).arg(ttl_seconds(ttl));
        let result: i64 = self
            .run("compare-and-expire", invocation.invoke_async(&mut conn))
            .await?;
        Ok(result == 1)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let script = Script::new(COMPARE_AND_DELETE);
        let mut invocation = script.key(key);
        invocation.arg(expected);
        let result: i64 = self
            .run("compare-and-delete", invocation.invoke_async(&mut conn))
            .await?;
        Ok(result == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.run("DEL", redis::cmd("DEL").arg(key).query_async::<()>(&mut conn))
            .await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value = self
            .run("HGET", redis::cmd("HGET").arg(key).arg(field).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection.clone();
        let entries = self
            .run("HGETALL", redis::cmd("HGETALL").arg(key).query_async(&mut conn))
            .await?;
        Ok(entries)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.run(
            "HSET",
            redis::cmd("HSET")
                .arg(key)
                .arg(field)
                .arg(value)
                .query_async::<()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.run(
            "HDEL",
            redis::cmd("HDEL").arg(key).arg(field).query_async::<()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        self.run(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<()>(&mut conn),
        )
        .await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let mut pubsub = self
            .run("pub/sub connect", self.client.get_async_pubsub())
            .await?;
        self.run("SUBSCRIBE", pubsub.subscribe(channels)).await?;

        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(StoreMessage { channel, payload }),
                    Err(e) => {
                        warn!(error = %e, channel = %channel, "Invalid payload");
                        None
                    }
                }
            })
            .boxed();

        Ok(stream)
    }
}
