//! PipeCD Stores - typed records on the filestore and cache
//!
//! Each store owns one filestore prefix or one cache hash:
//!
//! | Store | Location |
//! |---|---|
//! | [`AnalysisResultStore`] | `latest-analysis-result/<app>.json`, cached |
//! | [`AnalysisMetadataStore`] | `analysis-metadata/<deployment>/<stage>.json`, cached |
//! | [`CommandOutputStore`] | `command-output/<id>.json` |
//! | [`SharedObjectStore`] | `application-shared-objects/<app>/<plugin>/<key>.json` |
//! | [`StageLogStore`] | `stage-logs/<deployment>/<stage>/<retried>.json` |
//! | [`InsightStore`] | `insights/<project>/<app>/<kind>/<step>/<period>.json` |
//! | [`PipedStatStore`] | hash `HASHKEY:PIPED:STATS` |
//! | [`ApiKeyLastUsedStore`] | hash `HASHKEY:PIPED:API_KEYS` |
//! | [`UnregisteredAppStore`] | hash `HASHKEY:UNREGISTERED_APPS:<project>` |
//!
//! Cached stores read through the cache and fall back to the filestore; cache
//! failures are logged and never surface to the caller.

pub mod analysis;
pub mod apikey;
pub mod command_output;
pub mod insight;
pub mod piped_stat;
pub mod shared_object;
pub mod stage_log;
pub mod unregistered_app;

pub use analysis::{AnalysisMetadataStore, AnalysisResultStore};
pub use apikey::ApiKeyLastUsedStore;
pub use command_output::CommandOutputStore;
pub use insight::InsightStore;
pub use piped_stat::{PipedStat, PipedStatStore};
pub use shared_object::SharedObjectStore;
pub use stage_log::{LogBlock, LogSeverity, StageLogStore};
pub use unregistered_app::{ApplicationInfo, UnregisteredAppStore};

use bytes::Bytes;
use pipecd_cache::Cache;
use pipecd_common::{Error, Result};
use pipecd_filestore::Store;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::warn;

pub(crate) fn decode<T: DeserializeOwned>(what: &str, raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| Error::internal(format!("failed to decode {what}: {e}")))
}

pub(crate) async fn get_json<T: DeserializeOwned>(fs: &dyn Store, path: &str) -> Result<T> {
    let raw = fs.get(path).await?;
    decode(path, &raw)
}

pub(crate) async fn put_json<T: Serialize + Sync>(fs: &dyn Store, path: &str, value: &T) -> Result<()> {
    let raw = serde_json::to_vec(value)?;
    fs.put(path, Bytes::from(raw)).await
}

/// Filestore record fronted by a TTL cache
///
/// Writes go to the filestore first; the cache copy is refreshed after.
pub(crate) struct ReadThrough {
    fs: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

impl ReadThrough {
    pub(crate) fn new(fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { fs, cache }
    }

    pub(crate) async fn get<T: DeserializeOwned + Serialize + Sync>(&self, key: &str, path: &str) -> Result<T> {
        match self.cache.get(key).await {
            Ok(raw) => match decode::<T>(key, &raw) {
                Ok(v) => {
                    metrics::counter!("store_cache_total", "result" => "hit").increment(1);
                    return Ok(v);
                }
                Err(e) => warn!(key = %key, error = %e, "dropping undecodable cache entry"),
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %key, error = %e, "failed to read cache"),
        }
        metrics::counter!("store_cache_total", "result" => "miss").increment(1);

        let value: T = get_json(self.fs.as_ref(), path).await?;
        self.refresh(key, &value).await;
        Ok(value)
    }

    pub(crate) async fn put<T: Serialize + Sync>(&self, key: &str, path: &str, value: &T) -> Result<()> {
        put_json(self.fs.as_ref(), path, value).await?;
        self.refresh(key, value).await;
        Ok(())
    }

    async fn refresh<T: Serialize + Sync>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_vec(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.cache.put(key, &raw).await {
            warn!(key = %key, error = %e, "failed to write cache");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use pipecd_cache::Cache;
    use pipecd_common::{Error, Result};

    /// Cache whose every call fails
    pub struct BrokenCache;

    #[async_trait]
    impl Cache for BrokenCache {
        async fn get(&self, _key: &str) -> Result<Vec<u8>> {
            Err(Error::internal("connection refused"))
        }

        async fn put(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(Error::internal("connection refused"))
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Err(Error::internal("connection refused"))
        }
    }
}
