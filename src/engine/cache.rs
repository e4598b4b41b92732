//! Short-lived cache of final replies, keyed by flow and message.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::types::ReplyPayload;

/// Upper bound on stored entries before an insert forces a prune.
const MAX_ENTRIES: usize = 1024;

/// Reply cache shared by every request. Concurrent writers to the same key
/// follow last-writer-wins.
#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<ReplyPayload>;
    async fn set(&self, key: &str, value: ReplyPayload, ttl: Duration);
}

/// `sha256(flow_id || 0x00 || message)`, hex encoded.
pub fn cache_key(flow_id: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(flow_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(message.as_bytes());
    hex::encode(hasher.finalize())
}

struct CacheEntry {
    value: ReplyPayload,
    expires_at: Instant,
}

/// In-process `ResponseCache` with per-entry TTL.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove expired entries.
    pub fn prune(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        let evicted = before - entries.len();
        if evicted > 0 {
            tracing::debug!(evicted, "Pruned expired cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for MemoryCache {
    async fn get(&self, key: &str) -> Option<ReplyPayload> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: ReplyPayload, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if self.len() >= MAX_ENTRIES {
            self.prune();
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(text: &str) -> ReplyPayload {
        ReplyPayload {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_separates_fields() {
        let a = cache_key("flow", "hello");
        assert_eq!(a, cache_key("flow", "hello"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, cache_key("flowh", "ello"));
        assert_ne!(a, cache_key("other", "hello"));
    }

    #[tokio::test]
    async fn test_get_after_set() {
        let cache = MemoryCache::new();
        cache.set("k", reply("cached"), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.unwrap().text.as_deref(), Some("cached"));
        assert!(cache.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let cache = MemoryCache::new();
        cache.set("k", reply("first"), Duration::from_secs(60)).await;
        cache.set("k", reply("second"), Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await.unwrap().text.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_expired_entries_are_evicted() {
        let cache = MemoryCache::new();
        cache.set("k", reply("short"), Duration::from_millis(20)).await;
        cache.set("keep", reply("long"), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("k").await.is_none());
        cache.prune();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_disables_caching() {
        let cache = MemoryCache::new();
        cache.set("k", reply("x"), Duration::ZERO).await;
        assert!(cache.is_empty());
    }
}
