// ===============================
// src/cache.rs
// ===============================
//
// Pub/sub + key/value cache seam. Production deployments point this at the
// shared cache; `MemoryCache` is the in-process implementation used by the
// binary in standalone mode and by tests.
//
use std::time::{Duration, Instant};

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::domain::{CycleStatus, Envelope};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub fn market_key(market_id: &str) -> String { format!("market:{market_id}") }
pub fn bond_key(bond_id: &str) -> String { format!("bond:{bond_id}") }
pub fn status_key(loop_name: &str) -> String { format!("status:{loop_name}") }
pub const MARKETS_LIST_KEY: &str = "markets:list";

#[async_trait]
pub trait CacheBus: Send + Sync {
    /// Fan out an envelope; returns the number of live subscribers.
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, CacheError>;
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// Delete every key starting with `prefix`; returns how many were removed.
    async fn del_prefix(&self, prefix: &str) -> Result<usize, CacheError>;
}

pub struct MemoryCache {
    entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    capacity: usize,
}

impl Default for MemoryCache {
    fn default() -> Self { Self::new(1024) }
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self { entries: Mutex::new(HashMap::new()), channels: Mutex::new(HashMap::new()), capacity }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut chans = self.channels.lock();
        chans
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        self.sender(channel).subscribe()
    }

    /// Plain set without expiry (cached read views).
    pub fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), (value, None));
    }
}

#[async_trait]
impl CacheBus for MemoryCache {
    async fn publish(&self, channel: &str, envelope: &Envelope) -> Result<usize, CacheError> {
        let msg = serde_json::to_string(envelope)?;
        // no subscribers is not an error for pub/sub
        Ok(self.sender(channel).send(msg).unwrap_or(0))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.lock().insert(key.to_string(), (value, Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            None => return Ok(None),
            Some((_, Some(deadline))) => Instant::now() >= *deadline,
            Some((_, None)) => false,
        };
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(v, _)| v.clone()))
    }

    async fn del_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|k, _| !k.starts_with(prefix));
        Ok(before - entries.len())
    }
}

/// Store a loop's cycle record under `status:{loop}` with a short TTL.
pub async fn write_status(
    cache: &dyn CacheBus,
    loop_name: &str,
    status: &CycleStatus,
    ttl: Duration,
) -> Result<(), CacheError> {
    let body = serde_json::to_string(status)?;
    cache.set_ex(&status_key(loop_name), body, ttl).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ttl_entries_expire() {
        let cache = MemoryCache::default();
        cache.set_ex("status:x", "{}".into(), Duration::from_millis(20)).await.unwrap();
        assert_eq!(cache.get("status:x").await.unwrap().as_deref(), Some("{}"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("status:x").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let cache = MemoryCache::default();
        assert_eq!(cache.publish("trades", &Envelope::new("trade", json!({}))).await.unwrap(), 0);

        let mut rx = cache.subscribe("trades");
        let n = cache.publish("trades", &Envelope::new("trade", json!({"a": 1}))).await.unwrap();
        assert_eq!(n, 1);
        let msg: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "trade");
        assert_eq!(msg["data"]["a"], 1);
        assert!(msg.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn del_prefix_only_touches_matching_keys() {
        let cache = MemoryCache::default();
        cache.set("market:m1", "a".into());
        cache.set("market:m1:history", "b".into());
        cache.set("market:m2", "c".into());
        assert_eq!(cache.del_prefix(&market_key("m1")).await.unwrap(), 2);
        assert!(cache.get("market:m2").await.unwrap().is_some());
    }
}
