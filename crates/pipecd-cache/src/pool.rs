//! Bounded connection pool
//!
//! At most `max_active` connections are checked out at once; released
//! connections are kept for reuse up to `max_idle`. An idle connection is
//! pinged on checkout only when it has not been verified for
//! `conn_check_interval`, and dropped once it has been idle for longer than
//! `idle_timeout`.

use async_trait::async_trait;
use parking_lot::Mutex;
use pipecd_common::config::CachePoolConfig;
use pipecd_common::{Error, Result};
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Idle connections retained for reuse
    pub max_idle: usize,
    /// Connections checked out at the same time; 0 means unbounded
    pub max_active: usize,
    pub idle_timeout: Duration,
    pub conn_check_interval: Duration,
    /// Bound on dialing and on waiting for a free slot
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            max_active: 100,
            idle_timeout: Duration::from_secs(240),
            conn_check_interval: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&CachePoolConfig> for PoolConfig {
    fn from(cfg: &CachePoolConfig) -> Self {
        let d = Self::default();
        Self {
            max_idle: cfg.max_idle.unwrap_or(d.max_idle),
            max_active: cfg.max_active.unwrap_or(d.max_active),
            idle_timeout: cfg.idle_timeout.map_or(d.idle_timeout, |t| t.as_std()),
            conn_check_interval: cfg.conn_check_interval.map_or(d.conn_check_interval, |t| t.as_std()),
            dial_timeout: cfg.dial_timeout.map_or(d.dial_timeout, |t| t.as_std()),
        }
    }
}

/// Dials and health-checks connections for a [`Pool`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Send + 'static;

    async fn connect(&self) -> Result<Self::Conn>;

    async fn ping(&self, conn: &mut Self::Conn) -> Result<()>;
}

struct IdleConn<T> {
    conn: T,
    returned_at: Instant,
    checked_at: Instant,
}

pub struct Pool<C: Connector> {
    connector: C,
    config: PoolConfig,
    idle: Mutex<VecDeque<IdleConn<C::Conn>>>,
    active: Arc<Semaphore>,
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, config: PoolConfig) -> Arc<Self> {
        let permits = if config.max_active == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_active
        };
        Arc::new(Self {
            connector,
            config,
            idle: Mutex::new(VecDeque::new()),
            active: Arc::new(Semaphore::new(permits)),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Check out a connection, reusing an idle one when possible
    pub async fn get(self: &Arc<Self>) -> Result<PooledConn<C>> {
        let permit = tokio::time::timeout(self.config.dial_timeout, self.active.clone().acquire_owned())
            .await
            .map_err(|_| Error::deadline_exceeded("timed out waiting for a free cache connection"))?
            .map_err(|_| Error::internal("cache pool is closed"))?;

        while let Some(idle) = self.pop_idle() {
            if idle.returned_at.elapsed() > self.config.idle_timeout {
                debug!("dropping expired idle connection");
                continue;
            }
            let mut conn = idle.conn;
            let mut checked_at = idle.checked_at;
            if checked_at.elapsed() >= self.config.conn_check_interval {
                if let Err(e) = self.connector.ping(&mut conn).await {
                    debug!(error = %e, "dropping idle connection that failed ping");
                    continue;
                }
                checked_at = Instant::now();
            }
            return Ok(PooledConn::new(conn, checked_at, self.clone(), permit));
        }

        let conn = tokio::time::timeout(self.config.dial_timeout, self.connector.connect())
            .await
            .map_err(|_| Error::deadline_exceeded("timed out dialing the cache"))??;
        Ok(PooledConn::new(conn, Instant::now(), self.clone(), permit))
    }

    fn pop_idle(&self) -> Option<IdleConn<C::Conn>> {
        self.idle.lock().pop_back()
    }

    fn put_idle(&self, conn: C::Conn, checked_at: Instant) {
        let mut idle = self.idle.lock();
        if idle.len() >= self.config.max_idle {
            return;
        }
        idle.push_back(IdleConn {
            conn,
            returned_at: Instant::now(),
            checked_at,
        });
    }
}

/// Checked-out connection; returned to the pool on drop
pub struct PooledConn<C: Connector> {
    conn: Option<C::Conn>,
    checked_at: Instant,
    broken: bool,
    pool: Arc<Pool<C>>,
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> PooledConn<C> {
    fn new(conn: C::Conn, checked_at: Instant, pool: Arc<Pool<C>>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            conn: Some(conn),
            checked_at,
            broken: false,
            pool,
            _permit: permit,
        }
    }

    /// Discard the connection instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> Deref for PooledConn<C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> DerefMut for PooledConn<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl<C: Connector> Drop for PooledConn<C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.broken {
                self.pool.put_idle(conn, self.checked_at);
            }
        }
    }
}
