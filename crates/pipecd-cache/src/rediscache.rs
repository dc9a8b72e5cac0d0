//! Redis-backed caches

use crate::pool::{Connector, Pool, PoolConfig, PooledConn};
use crate::{Cache, HashCache, HashCacheFactory, observe};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, RedisError};
use async_trait::async_trait;
use pipecd_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub type RedisPool = Pool<RedisConnector>;

pub struct RedisConnector {
    client: ::redis::Client,
}

impl RedisConnector {
    /// `address` is `host:port` or a full `redis://` URL
    pub fn new(address: &str, password: Option<&str>) -> Result<Self> {
        let client = ::redis::Client::open(redis_url(address, password))
            .map_err(|e| Error::configuration(format!("invalid cache address {address}: {e}")))?;
        Ok(Self { client })
    }

    /// Build a pool for `address`
    pub fn pool(address: &str, password: Option<&str>, config: PoolConfig) -> Result<Arc<RedisPool>> {
        Ok(Pool::new(Self::new(address, password)?, config))
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Conn = MultiplexedConnection;

    async fn connect(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::internal(format!("failed to connect to cache: {e}")))
    }

    async fn ping(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let pong: std::result::Result<String, RedisError> = ::redis::cmd("PING").query_async(conn).await;
        pong.map(|_| ()).map_err(|e| Error::internal(e.to_string()))
    }
}

fn redis_url(address: &str, password: Option<&str>) -> String {
    if address.contains("://") {
        return address.to_string();
    }
    match password {
        Some(p) if !p.is_empty() => format!("redis://:{}@{address}", urlencoding::encode(p)),
        _ => format!("redis://{address}"),
    }
}

/// Map a redis error and retire the connection when the transport broke
fn check<T>(conn: &mut PooledConn<RedisConnector>, res: std::result::Result<T, RedisError>) -> Result<T> {
    res.map_err(|e| {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            conn.mark_broken();
        }
        Error::internal(format!("cache: {e}"))
    })
}

/// Plain keys with a default time-to-live
pub struct RedisTtlCache {
    pool: Arc<RedisPool>,
    ttl: Duration,
}

impl RedisTtlCache {
    /// A zero `ttl` stores keys without expiry
    pub const fn new(pool: Arc<RedisPool>, ttl: Duration) -> Self {
        Self { pool, ttl }
    }

    pub async fn put_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let res = self.set(key, value, ttl).await;
        observe("put", &res);
        res
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let c: &mut MultiplexedConnection = &mut conn;
        let res: std::result::Result<(), RedisError> = if ttl.is_zero() {
            c.set(key, value).await
        } else {
            c.set_ex(key, value, ttl.as_secs().max(1)).await
        };
        check(&mut conn, res)
    }
}

#[async_trait]
impl Cache for RedisTtlCache {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<Option<Vec<u8>>, RedisError> = c.get(key).await;
            check(&mut conn, res)?.ok_or_else(|| Error::not_found(key.to_string()))
        }
        .await;
        observe("get", &res);
        res
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_with_ttl(key, value, self.ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<(), RedisError> = c.del(key).await;
            check(&mut conn, res)
        }
        .await;
        observe("delete", &res);
        res
    }
}

/// Fields of the hash stored at `key`
pub struct RedisHashCache {
    pool: Arc<RedisPool>,
    key: String,
    ttl: Duration,
}

impl RedisHashCache {
    pub fn new(pool: Arc<RedisPool>, key: impl Into<String>) -> Self {
        Self {
            pool,
            key: key.into(),
            ttl: Duration::ZERO,
        }
    }

    /// Expire the whole hash `ttl` after the write that created it
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl Cache for RedisHashCache {
    async fn get(&self, field: &str) -> Result<Vec<u8>> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<Option<Vec<u8>>, RedisError> = c.hget(&self.key, field).await;
            check(&mut conn, res)?.ok_or_else(|| Error::not_found(format!("{}/{field}", self.key)))
        }
        .await;
        observe("hget", &res);
        res
    }

    async fn put(&self, field: &str, value: &[u8]) -> Result<()> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<(), RedisError> = c.hset(&self.key, field, value).await;
            check(&mut conn, res)?;
            if self.ttl.is_zero() {
                return Ok(());
            }
            // -1: the hash exists without an expiry
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<i64, RedisError> = c.ttl(&self.key).await;
            if check(&mut conn, res)? == -1 {
                let secs = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
                let c: &mut MultiplexedConnection = &mut conn;
                let res: std::result::Result<(), RedisError> = c.expire(&self.key, secs).await;
                check(&mut conn, res)?;
            }
            Ok(())
        }
        .await;
        observe("hset", &res);
        res
    }

    async fn delete(&self, field: &str) -> Result<()> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<(), RedisError> = c.hdel(&self.key, field).await;
            check(&mut conn, res)
        }
        .await;
        observe("hdel", &res);
        res
    }
}

#[async_trait]
impl HashCache for RedisHashCache {
    async fn get_all(&self) -> Result<HashMap<String, Vec<u8>>> {
        let res = async {
            let mut conn = self.pool.get().await?;
            let c: &mut MultiplexedConnection = &mut conn;
            let res: std::result::Result<HashMap<String, Vec<u8>>, RedisError> = c.hgetall(&self.key).await;
            let all = check(&mut conn, res)?;
            if all.is_empty() {
                return Err(Error::not_found(self.key.clone()));
            }
            Ok(all)
        }
        .await;
        observe("hgetall", &res);
        res
    }
}

/// Hashes by key on one pool, each expiring `ttl` after creation
pub struct RedisHashCaches {
    pool: Arc<RedisPool>,
    ttl: Duration,
}

impl RedisHashCaches {
    pub const fn new(pool: Arc<RedisPool>, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

impl HashCacheFactory for RedisHashCaches {
    fn hash(&self, key: &str) -> Arc<dyn HashCache> {
        Arc::new(RedisHashCache::new(self.pool.clone(), key).with_ttl(self.ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecd_common::config::CachePoolConfig;

    #[test]
    fn test_redis_url() {
        assert_eq!(redis_url("cache:6379", None), "redis://cache:6379");
        assert_eq!(redis_url("cache:6379", Some("")), "redis://cache:6379");
        assert_eq!(redis_url("cache:6379", Some("p@ss")), "redis://:p%40ss@cache:6379");
        assert_eq!(redis_url("rediss://cache:6380", Some("x")), "rediss://cache:6380");
    }

    #[test]
    fn test_pool_takes_configured_limits() {
        let cfg = CachePoolConfig {
            max_idle: Some(2),
            max_active: Some(7),
            idle_timeout: Some(pipecd_common::Duration::from_secs(30)),
            ..Default::default()
        };
        let pool = RedisConnector::pool("cache:6379", None, PoolConfig::from(&cfg)).unwrap();
        let got = pool.config();
        assert_eq!(got.max_idle, 2);
        assert_eq!(got.max_active, 7);
        assert_eq!(got.idle_timeout, Duration::from_secs(30));
        assert_eq!(got.dial_timeout, PoolConfig::default().dial_timeout);
    }

    #[test]
    fn test_connector_rejects_bad_address() {
        assert!(RedisConnector::new("unix-nope://", None).is_err());
    }
}
