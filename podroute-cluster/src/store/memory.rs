use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::warn;

use super::{ttl_seconds, CoordinationStore, MessageStream, StoreMessage};
use crate::error::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process coordination store
///
/// Expiry follows the tokio clock, so paused-time tests can move leases
/// forward. Cloning shares the same underlying data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: std::sync::Arc<Inner>,
}

struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    messages: Mutex<broadcast::Sender<StoreMessage>>,
    available: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: std::sync::Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                messages: Mutex::new(sender),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage: while unavailable every call fails and
    /// open subscriptions are closed.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if !available {
            let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
            *self.inner.messages.lock() = sender;
        }
    }

    /// Remaining TTL of `key`, if it exists and expires
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.inner.entries.lock();
        entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at.saturating_duration_since(now))
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<T>) -> Result<T> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(Error::Store("memory store unavailable".to_string()));
        }
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        entries.retain(|_, entry| !entry.is_expired(now));
        f(&mut entries)
    }

    fn wrong_type(key: &str) -> Error {
        Error::Store(format!("WRONGTYPE operation against key {key}"))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn text_of<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Result<Option<&'a String>> {
    match entries.get(key) {
        None => Ok(None),
        Some(Entry {
            value: Value::Text(text),
            ..
        }) => Ok(Some(text)),
        Some(_) => Err(MemoryStore::wrong_type(key)),
    }
}

fn hash_of<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut HashMap<String, String>> {
    let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Hash(hash) => Ok(hash),
        Value::Text(_) => Err(MemoryStore::wrong_type(key)),
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return Ok(false);
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Text(value.to_string()),
                    expires_at: Some(Instant::now() + Duration::from_secs(ttl_seconds(ttl))),
                },
            );
            Ok(true)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entries(|entries| Ok(text_of(entries, key)?.cloned()))
    }

    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration) -> Result<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) if matches!(&entry.value, Value::Text(v) if v == expected) => {
                entry.expires_at = Some(Instant::now() + Duration::from_secs(ttl_seconds(ttl)));
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.with_entries(|entries| {
            if text_of(entries, key)?.is_some_and(|v| v == expected) {
                entries.remove(key);
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_entries(|entries| {
            entries.remove(key);
            Ok(())
        })
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.get(field).cloned()),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_entries(|entries| match entries.get(key) {
            None => Ok(HashMap::new()),
            Some(Entry {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.clone()),
            Some(_) => Err(Self::wrong_type(key)),
        })
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_entries(|entries| {
            hash_of(entries, key)?.insert(field.to_string(), value.to_string());
            Ok(())
        })
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        self.with_entries(|entries| {
            let now_empty = match entries.get_mut(key) {
                None => return Ok(()),
                Some(Entry {
                    value: Value::Hash(hash),
                    ..
                }) => {
                    hash.remove(field);
                    hash.is_empty()
                }
                Some(_) => return Err(Self::wrong_type(key)),
            };
            if now_empty {
                entries.remove(key);
            }
            Ok(())
        })
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.with_entries(|_| Ok(()))?;
        // no receivers is not an error, same as PUBLISH reaching zero clients
        let _ = self.inner.messages.lock().send(StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        self.with_entries(|_| Ok(()))?;
        let receiver = self.inner.messages.lock().subscribe();
        let channels: HashSet<String> = channels.iter().cloned().collect();

        let stream = futures::stream::unfold((receiver, channels), |(mut receiver, channels)| async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) if channels.contains(&msg.channel) => {
                        return Some((msg, (receiver, channels)));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Memory store subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
        .boxed();

        Ok(stream)
    }
}
