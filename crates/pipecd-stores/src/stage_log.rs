//! Logs of pipeline stages, one blob per stage attempt
//!
//! A piped appends blocks while a stage runs and finally uploads the full
//! log with the completed flag. Completed logs are immutable, so they are
//! also kept in the cache.

use crate::{decode, get_json, put_json};
use pipecd_cache::Cache;
use pipecd_common::{Error, Result};
use pipecd_filestore::Store;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSeverity {
    #[default]
    Info,
    Success,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogBlock {
    /// Monotonic per stage attempt, starting at 1
    pub index: i64,
    pub log: String,
    pub severity: LogSeverity,
    pub created_at: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StageLog {
    blocks: Vec<LogBlock>,
    completed: bool,
}

pub struct StageLogStore {
    fs: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

fn path(deployment_id: &str, stage_id: &str, retried_count: i32) -> String {
    format!("stage-logs/{deployment_id}/{stage_id}/{retried_count}.json")
}

fn cache_key(deployment_id: &str, stage_id: &str, retried_count: i32) -> String {
    format!("stage-logs:{deployment_id}:{stage_id}:{retried_count}")
}

impl StageLogStore {
    pub fn new(fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { fs, cache }
    }

    async fn load(&self, deployment_id: &str, stage_id: &str, retried_count: i32) -> Result<StageLog> {
        let key = cache_key(deployment_id, stage_id, retried_count);
        match self.cache.get(&key).await {
            Ok(raw) => match decode::<StageLog>(&key, &raw) {
                Ok(log) => return Ok(log),
                Err(e) => warn!(key = %key, error = %e, "dropping undecodable cached stage log"),
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %key, error = %e, "failed to read stage log cache"),
        }
        let log: StageLog = get_json(self.fs.as_ref(), &path(deployment_id, stage_id, retried_count)).await?;
        if log.completed {
            self.cache_completed(&key, &log).await;
        }
        Ok(log)
    }

    async fn cache_completed(&self, key: &str, log: &StageLog) {
        match serde_json::to_vec(log) {
            Ok(raw) => {
                if let Err(e) = self.cache.put(key, &raw).await {
                    warn!(key = %key, error = %e, "failed to cache completed stage log");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "failed to encode stage log"),
        }
    }

    /// Blocks with an index at or after `offset_index`, and whether the log is complete
    pub async fn fetch_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: i32,
        offset_index: i64,
    ) -> Result<(Vec<LogBlock>, bool)> {
        let log = self.load(deployment_id, stage_id, retried_count).await?;
        let blocks = log.blocks.into_iter().filter(|b| b.index >= offset_index).collect();
        Ok((blocks, log.completed))
    }

    /// Add blocks past the last stored index; a completed log rejects appends
    pub async fn append_logs(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: i32,
        blocks: &[LogBlock],
    ) -> Result<()> {
        let mut log = match self.load(deployment_id, stage_id, retried_count).await {
            Ok(log) => log,
            Err(e) if e.is_not_found() => StageLog::default(),
            Err(e) => return Err(e),
        };
        if log.completed {
            return Err(Error::invalid_argument(format!(
                "stage log of {deployment_id}/{stage_id} attempt {retried_count} is already completed"
            )));
        }
        let last = log.blocks.last().map_or(0, |b| b.index);
        log.blocks.extend(blocks.iter().filter(|b| b.index > last).cloned());
        put_json(self.fs.as_ref(), &path(deployment_id, stage_id, retried_count), &log).await
    }

    /// Replace the stored log with the full one the piped holds
    pub async fn append_logs_from_last_checkpoint(
        &self,
        deployment_id: &str,
        stage_id: &str,
        retried_count: i32,
        blocks: &[LogBlock],
        completed: bool,
    ) -> Result<()> {
        let log = StageLog {
            blocks: blocks.to_vec(),
            completed,
        };
        put_json(self.fs.as_ref(), &path(deployment_id, stage_id, retried_count), &log).await?;
        if completed {
            self.cache_completed(&cache_key(deployment_id, stage_id, retried_count), &log)
                .await;
        }
        Ok(())
    }
}
