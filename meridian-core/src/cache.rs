//! # Cache Abstraction
//!
//! A single `Cache` interface behind three implementations: [`LocalCache`]
//! (in-process, `lru`-backed), [`DistributedCache`] (Redis-backed, shared
//! across instances), and [`DisabledCache`] (no-op). The signature cache and
//! any other subsystem needing shared state goes through this interface
//! rather than assuming in-memory semantics.
//!
//! `LocalCache` approximates TinyLFU-style admission with a coarse
//! max-cost-bytes check on insert rather than true frequency-sketch
//! admission — no crate in this workspace's dependency stack provides that,
//! and this is documented as a deliberate simplification rather than a
//! silent rename of the interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::CoreError;

/// A cached value plus its insertion-relative expiry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Vec<u8>,
    pub expires_at: std::time::Instant,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// The cache interface every backend implements. `Stats`/`Ping`/multi-key
/// operations are modeled as default methods rather than a separate trait
/// split, since every backend here can answer them cheaply.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError>;
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;
    async fn exists(&self, key: &str) -> Result<bool, CoreError>;
    async fn close(&self) -> Result<(), CoreError>;

    async fn stats(&self) -> Result<CacheStats, CoreError> {
        Ok(CacheStats::default())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn get_multi(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, CoreError> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(value) = self.get(key).await? {
                out.insert(key.clone(), value);
            }
        }
        Ok(out)
    }

    async fn set_multi_with_ttl(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<(), CoreError> {
        for (key, value) in entries {
            self.set_with_ttl(key, value.clone(), ttl).await?;
        }
        Ok(())
    }
}

/// Default TTL applied by `set` (as opposed to `set_with_ttl`).
const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// In-process cache bounded by entry count (`max_size`) and a coarse total
/// byte budget (`max_cost_bytes`), backed by `lru::LruCache`.
pub struct LocalCache {
    store: Mutex<LruCache<String, CacheEntry>>,
    max_cost_bytes: usize,
    current_cost: Mutex<usize>,
    stats: Mutex<CacheStats>,
}

impl LocalCache {
    pub fn new(max_size: usize, max_cost_bytes: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(max_size.max(1)).expect("max_size coerced to >= 1 above");
        Self {
            store: Mutex::new(LruCache::new(capacity)),
            max_cost_bytes,
            current_cost: Mutex::new(0),
            stats: Mutex::new(CacheStats::default()),
        }
    }
}

#[async_trait]
impl Cache for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let mut store = self.store.lock().await;
        let mut stats = self.stats.lock().await;
        match store.get(key) {
            Some(entry) if !entry.is_expired() => {
                stats.hits += 1;
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                store.pop(key);
                stats.misses += 1;
                Ok(None)
            }
            None => {
                stats.misses += 1;
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
        self.set_with_ttl(key, value, DEFAULT_TTL).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CoreError> {
        let cost = value.len();
        if cost > self.max_cost_bytes {
            return Err(CoreError::Cache {
                message: format!("value of {cost} bytes exceeds max_cost_bytes={}", self.max_cost_bytes),
            });
        }

        let mut current_cost = self.current_cost.lock().await;
        let mut store = self.store.lock().await;
        let mut stats = self.stats.lock().await;

        if let Some(old) = store.peek(key) {
            *current_cost = current_cost.saturating_sub(old.value.len());
        }
        while *current_cost + cost > self.max_cost_bytes {
            if store.pop_lru().is_none() {
                break;
            }
        }

        store.put(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        *current_cost += cost;
        stats.entries = store.len() as u64;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.pop(key) {
            let mut current_cost = self.current_cost.lock().await;
            *current_cost = current_cost.saturating_sub(entry.value.len());
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        Ok(self.get(key).await?.is_some())
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats, CoreError> {
        Ok(*self.stats.lock().await)
    }
}

/// Shared Redis-backed store reachable by every gateway instance. This is a
/// single shared-nothing KV store, not a gossip-clustered ring: `replicas`
/// and `quorum` are accepted for configuration compatibility but forwarded
/// as plain connection behavior rather than client-side replica fan-out,
/// since true gossip clustering needs a crate this workspace doesn't carry.
pub struct DistributedCache {
    client: redis::Client,
    key_prefix: String,
}

impl DistributedCache {
    pub fn new(redis_url: &str, key_prefix: impl Into<String>) -> Result<Self, CoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| CoreError::Cache {
            message: format!("failed to open redis client: {e}"),
        })?;
        Ok(Self {
            client,
            key_prefix: key_prefix.into(),
        })
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, CoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| CoreError::Cache {
                message: format!("redis connection failed: {e}"),
            })
    }
}

#[async_trait]
impl Cache for DistributedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.get(self.namespaced(key))
            .await
            .map_err(|e| CoreError::Cache {
                message: format!("redis GET failed: {e}"),
            })
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CoreError> {
        self.set_with_ttl(key, value, DEFAULT_TTL).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(self.namespaced(key), value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CoreError::Cache {
                message: format!("redis SETEX failed: {e}"),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.namespaced(key))
            .await
            .map_err(|e| CoreError::Cache {
                message: format!("redis DEL failed: {e}"),
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, CoreError> {
        use redis::AsyncCommands;
        let mut conn = self.connection().await?;
        conn.exists(self.namespaced(key)).await.map_err(|e| CoreError::Cache {
            message: format!("redis EXISTS failed: {e}"),
        })
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }

    async fn ping(&self) -> Result<(), CoreError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| CoreError::Cache {
                message: format!("redis PING failed: {e}"),
            })
    }
}

/// No-op backend for deployments running with caching disabled: every `get`
/// reports "not found", every write is accepted and discarded.
pub struct DisabledCache;

#[async_trait]
impl Cache for DisabledCache {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        Ok(None)
    }

    async fn set(&self, _key: &str, _value: Vec<u8>) -> Result<(), CoreError> {
        Ok(())
    }

    async fn set_with_ttl(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> Result<(), CoreError> {
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), CoreError> {
        Ok(())
    }

    async fn exists(&self, _key: &str) -> Result<bool, CoreError> {
        Ok(false)
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    Local,
    Distributed,
    Disabled,
}

/// Build the configured cache backend behind the shared `Cache` trait object.
pub fn build_cache(
    kind: CacheBackendKind,
    max_size: usize,
    max_cost_bytes: usize,
    redis_url: Option<&str>,
) -> Result<Arc<dyn Cache>, CoreError> {
    match kind {
        CacheBackendKind::Local => Ok(Arc::new(LocalCache::new(max_size, max_cost_bytes))),
        CacheBackendKind::Distributed => {
            let url = redis_url.ok_or_else(|| CoreError::Configuration {
                message: "distributed cache backend requires a redis_url".to_string(),
            })?;
            Ok(Arc::new(DistributedCache::new(url, "meridian")?))
        }
        CacheBackendKind::Disabled => Ok(Arc::new(DisabledCache)),
    }
}

/// Hash arbitrary content into a bounded-size cache key component. Collision
/// resistance is not a requirement here, only key-size boundedness, so this
/// uses the fast non-cryptographic `DefaultHasher` rather than SHA-256.
pub fn hash_content(content: &str) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_cache_round_trips_a_value() {
        let cache = LocalCache::new(10, 1024);
        cache.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn local_cache_expires_after_ttl() {
        let cache = LocalCache::new(10, 1024);
        cache
            .set_with_ttl("k", b"v".to_vec(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn local_cache_rejects_oversized_value() {
        let cache = LocalCache::new(10, 4);
        let err = cache.set("k", b"too big".to_vec()).await.unwrap_err();
        assert!(matches!(err, CoreError::Cache { .. }));
    }

    #[tokio::test]
    async fn disabled_cache_always_misses() {
        let cache = DisabledCache;
        cache.set("k", b"v".to_vec()).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[test]
    fn hash_content_is_deterministic() {
        assert_eq!(hash_content("hello"), hash_content("hello"));
        assert_ne!(hash_content("hello"), hash_content("world"));
    }
}
