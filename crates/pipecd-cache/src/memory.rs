//! In-process caches
//!
//! Used by single-replica deployments without a cache service and as the
//! hermetic backend in tests.

use crate::{Cache, HashCache, HashCacheFactory, observe};
use async_trait::async_trait;
use parking_lot::RwLock;
use pipecd_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|t| now < t)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) {
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        self.entries.write().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.read().values().filter(|e| e.live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let now = Instant::now();
        let res = self
            .entries
            .read()
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::not_found(key.to_string()));
        observe("get", &res);
        res
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_with_ttl(key, value, self.ttl);
        observe("put", &Ok::<(), Error>(()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

/// Hash whose expiry is set by the first write after it became empty
#[derive(Default)]
pub struct MemoryHashCache {
    fields: RwLock<(HashMap<String, Vec<u8>>, Option<Instant>)>,
    ttl: Duration,
}

impl MemoryHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Drop the hash when it expired; mirrors server-side key expiry
    fn expire(&self) {
        let mut guard = self.fields.write();
        if guard.1.is_some_and(|t| Instant::now() >= t) {
            *guard = (HashMap::new(), None);
        }
    }
}

#[async_trait]
impl Cache for MemoryHashCache {
    async fn get(&self, field: &str) -> Result<Vec<u8>> {
        self.expire();
        let res = self
            .fields
            .read()
            .0
            .get(field)
            .cloned()
            .ok_or_else(|| Error::not_found(field.to_string()));
        observe("hget", &res);
        res
    }

    async fn put(&self, field: &str, value: &[u8]) -> Result<()> {
        self.expire();
        let mut guard = self.fields.write();
        guard.0.insert(field.to_string(), value.to_vec());
        if guard.1.is_none() && !self.ttl.is_zero() {
            guard.1 = Some(Instant::now() + self.ttl);
        }
        Ok(())
    }

    async fn delete(&self, field: &str) -> Result<()> {
        let mut guard = self.fields.write();
        guard.0.remove(field);
        if guard.0.is_empty() {
            guard.1 = None;
        }
        Ok(())
    }
}

#[async_trait]
impl HashCache for MemoryHashCache {
    async fn get_all(&self) -> Result<HashMap<String, Vec<u8>>> {
        self.expire();
        let all = self.fields.read().0.clone();
        if all.is_empty() {
            return Err(Error::not_found("hash is empty"));
        }
        Ok(all)
    }
}

/// In-process hashes by key, sharing one TTL
#[derive(Default)]
pub struct MemoryHashCaches {
    hashes: RwLock<HashMap<String, Arc<MemoryHashCache>>>,
    ttl: Duration,
}

impl MemoryHashCaches {
    pub fn new(ttl: Duration) -> Self {
        Self {
            hashes: RwLock::default(),
            ttl,
        }
    }
}

impl HashCacheFactory for MemoryHashCaches {
    fn hash(&self, key: &str) -> Arc<dyn HashCache> {
        if let Some(h) = self.hashes.read().get(key) {
            return h.clone();
        }
        self.hashes
            .write()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(MemoryHashCache::new().with_ttl(self.ttl)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_cache_miss_and_hit() {
        let cache = MemoryCache::new(Duration::ZERO);
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        cache.put("k", b"v").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), b"v");
        cache.delete("k").await.unwrap();
        assert!(cache.get("k").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_ttl_cache_expiry() {
        let cache = MemoryCache::new(Duration::from_millis(20));
        cache.put("k", b"v").await.unwrap();
        assert_eq!(cache.len(), 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").await.unwrap_err().is_not_found());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_hash_cache_get_all_empty_is_not_found() {
        let cache = MemoryHashCache::new();
        assert!(cache.get_all().await.unwrap_err().is_not_found());
        cache.put("a", b"1").await.unwrap();
        cache.put("b", b"2").await.unwrap();
        let all = cache.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        cache.delete("a").await.unwrap();
        cache.delete("b").await.unwrap();
        assert!(cache.get_all().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_hash_cache_field_delete_keeps_siblings() {
        let cache = MemoryHashCache::new();
        cache.put("a", b"1").await.unwrap();
        cache.put("b", b"2").await.unwrap();
        cache.delete("a").await.unwrap();
        assert!(cache.get("a").await.unwrap_err().is_not_found());
        assert_eq!(cache.get("b").await.unwrap(), b"2");
    }

    #[tokio::test]
    async fn test_hash_cache_expiry_not_refreshed_by_writes() {
        let cache = MemoryHashCache::new().with_ttl(Duration::from_millis(40));
        cache.put("a", b"1").await.unwrap();
        std::thread::sleep(Duration::from_millis(25));
        cache.put("b", b"2").await.unwrap();
        std::thread::sleep(Duration::from_millis(25));
        assert!(cache.get_all().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_hash_factory_shares_hashes_by_key() {
        let hashes = MemoryHashCaches::new(Duration::ZERO);
        hashes.hash("HASHKEY:A").put("f", b"1").await.unwrap();
        assert_eq!(hashes.hash("HASHKEY:A").get("f").await.unwrap(), b"1");
        assert!(hashes.hash("HASHKEY:B").get_all().await.unwrap_err().is_not_found());
    }
}
