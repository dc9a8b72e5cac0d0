//! PipeCD Cache - key/value cache fabric
//!
//! Two shapes share one connection pool:
//!
//! - [`Cache`]: plain keys with an optional time-to-live
//! - [`HashCache`]: fields of one namespaced hash, listable with
//!   [`HashCache::get_all`]
//!
//! A miss is always [`pipecd_common::Error::NotFound`].

pub mod memory;
pub mod pool;
pub mod rediscache;

use async_trait::async_trait;
use pipecd_common::Result;
use std::collections::HashMap;
use std::sync::Arc;

pub use memory::{MemoryCache, MemoryHashCache, MemoryHashCaches};
pub use pool::{Connector, Pool, PoolConfig, PooledConn};
pub use rediscache::{RedisConnector, RedisHashCache, RedisHashCaches, RedisPool, RedisTtlCache};

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;
}

/// Cache whose keys are fields of a single hash
#[async_trait]
pub trait HashCache: Cache {
    /// Every field of the hash; an empty hash is `NotFound`
    async fn get_all(&self) -> Result<HashMap<String, Vec<u8>>>;
}

/// Opens the hash stored at a key of a shared backend
pub trait HashCacheFactory: Send + Sync {
    fn hash(&self, key: &str) -> Arc<dyn HashCache>;
}

pub(crate) fn record(op: &'static str, result: &'static str) {
    metrics::counter!("cache_operations_total", "op" => op, "result" => result).increment(1);
}

/// Label a finished operation for the `cache_operations_total` counter
pub(crate) fn observe<T>(op: &'static str, res: &Result<T>) {
    let result = match res {
        Ok(_) => "ok",
        Err(e) if e.is_not_found() => "miss",
        Err(_) => "error",
    };
    record(op, result);
}
