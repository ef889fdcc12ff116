//! Multi-layer cache: in-process L1 with TTL plus an optional shared L2.
//!
//! Keys embed model versions and every routing flag, so code upgrades are
//! cache-safe without manual flushing. Reads probe L1 then L2; writes go to
//! both layers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

const L1_PURGE_THRESHOLD: usize = 4096;

/// Shared key/value backend (Redis-shaped): best-effort, never fatal.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
}

struct L1Entry {
    value: Value,
    expires_at: Instant,
}

pub struct MultiLayerCache {
    l1: Mutex<HashMap<String, L1Entry>>,
    l2: Option<Box<dyn KvBackend>>,
    default_ttl: Duration,
}

impl MultiLayerCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            l1: Mutex::new(HashMap::new()),
            l2: None,
            default_ttl,
        }
    }

    pub fn with_l2(mut self, backend: Box<dyn KvBackend>) -> Self {
        self.l2 = Some(backend);
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Probe L1 then L2. L2 hits are promoted into L1.
    pub async fn get(&self, key: &str) -> Option<(Value, &'static str)> {
        {
            let mut l1 = self.l1.lock().expect("cache lock poisoned");
            if let Some(entry) = l1.get(key) {
                if entry.expires_at > Instant::now() {
                    return Some((entry.value.clone(), "L1"));
                }
                l1.remove(key);
            }
        }

        if let Some(l2) = &self.l2 {
            if let Some(raw) = l2.get(key).await {
                match serde_json::from_str::<Value>(&raw) {
                    Ok(value) => {
                        self.put_l1(key, value.clone(), self.default_ttl);
                        return Some((value, "L2"));
                    }
                    Err(err) => warn!(error = %err, "L2 cache payload was not valid JSON"),
                }
            }
        }
        None
    }

    /// Write-through to both layers.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration) {
        self.put_l1(key, value.clone(), ttl);
        if let Some(l2) = &self.l2 {
            match serde_json::to_string(&value) {
                Ok(raw) => l2.set(key, raw, ttl).await,
                Err(err) => warn!(error = %err, "L2 cache serialization failed"),
            }
        }
    }

    fn put_l1(&self, key: &str, value: Value, ttl: Duration) {
        let mut l1 = self.l1.lock().expect("cache lock poisoned");
        if l1.len() >= L1_PURGE_THRESHOLD {
            let now = Instant::now();
            l1.retain(|_, entry| entry.expires_at > now);
        }
        l1.insert(
            key.to_string(),
            L1Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// Base cache key: hash of the identifying fields, prefixed by service.
pub fn generate_cache_key(
    service: &str,
    query: &str,
    user_id: &str,
    book_id: Option<&str>,
    limit: usize,
    version: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(user_id.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(book_id.unwrap_or("none").as_bytes());
    hasher.update(b"\x1f");
    hasher.update(limit.to_string().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(version.as_bytes());
    format!("{}:{}", service, hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn l1_roundtrip_is_idempotent() {
        let cache = MultiLayerCache::new(Duration::from_secs(60));
        let payload = json!({"results": [1, 2, 3], "total_count": 3});
        cache.set("k1", payload.clone(), Duration::from_secs(60)).await;

        let (value, layer) = cache.get("k1").await.unwrap();
        assert_eq!(value, payload);
        assert_eq!(layer, "L1");
    }

    #[tokio::test]
    async fn expired_entries_miss() {
        let cache = MultiLayerCache::new(Duration::from_secs(60));
        cache.set("k1", json!(1), Duration::from_millis(5)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("k1").await.is_none());
    }

    #[test]
    fn keys_differ_by_version_and_book() {
        let a = generate_cache_key("search", "q", "u", None, 10, "v1");
        let b = generate_cache_key("search", "q", "u", None, 10, "v2");
        let c = generate_cache_key("search", "q", "u", Some("b1"), 10, "v1");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("search:"));
    }
}
