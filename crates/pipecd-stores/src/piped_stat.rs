//! Piped heartbeats, kept in the cache only
//!
//! Every Ping overwrites the piped's field of `HASHKEY:PIPED:STATS`; the ops
//! cleaner deletes fields that stopped being refreshed.

use crate::decode;
use pipecd_cache::HashCache;
use pipecd_common::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

pub const PIPED_STATS_KEY: &str = "HASHKEY:PIPED:STATS";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipedStat {
    pub piped_id: String,
    /// Prometheus text exposition reported by the piped
    pub metrics: String,
    /// Unix seconds of the report
    pub timestamp: i64,
}

impl PipedStat {
    pub const fn is_stale(&self, now: i64, max_age_secs: i64) -> bool {
        now - self.timestamp > max_age_secs
    }
}

pub struct PipedStatStore {
    hash: Arc<dyn HashCache>,
}

impl PipedStatStore {
    pub fn new(hash: Arc<dyn HashCache>) -> Self {
        Self { hash }
    }

    pub async fn put(&self, stat: &PipedStat) -> Result<()> {
        let raw = serde_json::to_vec(stat)?;
        self.hash.put(&stat.piped_id, &raw).await
    }

    pub async fn get(&self, piped_id: &str) -> Result<PipedStat> {
        let raw = self.hash.get(piped_id).await?;
        decode(piped_id, &raw)
    }

    /// Every decodable stat; an empty hash yields an empty list
    pub async fn list(&self) -> Result<Vec<PipedStat>> {
        let all = match self.hash.get_all().await {
            Ok(all) => all,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut stats: Vec<PipedStat> = all
            .into_iter()
            .filter_map(|(field, raw)| match decode::<PipedStat>(&field, &raw) {
                Ok(stat) => Some(stat),
                Err(e) => {
                    warn!(piped_id = %field, error = %e, "skipping undecodable piped stat");
                    None
                }
            })
            .collect();
        stats.sort_by(|a, b| a.piped_id.cmp(&b.piped_id));
        Ok(stats)
    }

    /// Remove one piped's field, leaving the rest of the hash
    pub async fn delete(&self, piped_id: &str) -> Result<()> {
        self.hash.delete(piped_id).await
    }
}
