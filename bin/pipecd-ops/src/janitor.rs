//! Periodic cleanup and write-back jobs

use crate::schedule::Job;
use async_trait::async_trait;
use pipecd_common::Result;
use pipecd_common::model::CommandStatus;
use pipecd_datastore::{ApiKeyStore, CommandStore};
use pipecd_stores::{ApiKeyLastUsedStore, CommandOutputStore, PipedStatStore};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

pub const PIPED_STAT_CLEAN_INTERVAL: Duration = Duration::from_secs(24 * 3600);
pub const PIPED_STAT_MAX_AGE_SECS: i64 = 24 * 3600;

pub const ORPHAN_COMMAND_CLEAN_INTERVAL: Duration = Duration::from_secs(6 * 3600);
pub const ORPHAN_COMMAND_TTL_SECS: i64 = 24 * 3600;

pub const PLANPREVIEW_CLEAN_SCHEDULE: &str = "0 9 * * *";
pub const PLANPREVIEW_OUTPUT_TTL_SECS: i64 = 48 * 3600;

pub const API_KEY_LAST_USED_INTERVAL: Duration = Duration::from_secs(60);

/// Deletes piped stats nobody refreshed for a day
pub struct PipedStatCleaner {
    stats: PipedStatStore,
}

impl PipedStatCleaner {
    pub const fn new(stats: PipedStatStore) -> Self {
        Self { stats }
    }
}

#[async_trait]
impl Job for PipedStatCleaner {
    fn name(&self) -> &'static str {
        "piped-stat-cleaner"
    }

    async fn run(&self, now: i64) -> Result<()> {
        let mut deleted = 0;
        for stat in self.stats.list().await? {
            if !stat.is_stale(now, PIPED_STAT_MAX_AGE_SECS) {
                continue;
            }
            match self.stats.delete(&stat.piped_id).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(piped_id = %stat.piped_id, error = %e, "failed to delete stale piped stat"),
            }
        }
        info!(deleted, "cleaned stale piped stats");
        Ok(())
    }
}

/// Times out commands no piped picked up within a day
pub struct OrphanCommandCleaner {
    commands: CommandStore,
}

impl OrphanCommandCleaner {
    pub const fn new(commands: CommandStore) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Job for OrphanCommandCleaner {
    fn name(&self) -> &'static str {
        "orphan-command-cleaner"
    }

    async fn run(&self, now: i64) -> Result<()> {
        // Commands created at exactly now-24h are orphans too
        let orphans = self.commands.list_unhandled_before(now - ORPHAN_COMMAND_TTL_SECS + 1).await?;
        let total = orphans.len();
        let mut timed_out = 0;
        for cmd in orphans {
            match self
                .commands
                .update_handled(&cmd.id, CommandStatus::CommandTimeout, &BTreeMap::new(), now)
                .await
            {
                Ok(_) => timed_out += 1,
                Err(e) => warn!(command_id = %cmd.id, error = %e, "failed to time out orphan command"),
            }
        }
        info!(total, timed_out, "cleaned orphan commands");
        Ok(())
    }
}

/// Deletes plan-preview command outputs older than two days
pub struct PlanPreviewOutputCleaner {
    outputs: CommandOutputStore,
}

impl PlanPreviewOutputCleaner {
    pub const fn new(outputs: CommandOutputStore) -> Self {
        Self { outputs }
    }
}

#[async_trait]
impl Job for PlanPreviewOutputCleaner {
    fn name(&self) -> &'static str {
        "planpreview-output-cleaner"
    }

    async fn run(&self, now: i64) -> Result<()> {
        let expired = self.outputs.list_written_before(now - PLANPREVIEW_OUTPUT_TTL_SECS).await?;
        let mut deleted = 0;
        for id in &expired {
            match self.outputs.delete(id).await {
                Ok(()) => deleted += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(command_id = %id, error = %e, "failed to delete command output"),
            }
        }
        info!(deleted, "cleaned plan-preview outputs");
        Ok(())
    }
}

/// Writes the cached API-key last-used times back to the datastore
pub struct ApiKeyLastUsedUpdater {
    last_used: ApiKeyLastUsedStore,
    keys: ApiKeyStore,
}

impl ApiKeyLastUsedUpdater {
    pub const fn new(last_used: ApiKeyLastUsedStore, keys: ApiKeyStore) -> Self {
        Self { last_used, keys }
    }
}

#[async_trait]
impl Job for ApiKeyLastUsedUpdater {
    fn name(&self) -> &'static str {
        "api-key-last-used-updater"
    }

    async fn run(&self, _now: i64) -> Result<()> {
        for (id, used_at) in self.last_used.get_all().await? {
            if let Err(e) = self.keys.update_last_used(&id, used_at).await {
                warn!(api_key_id = %id, error = %e, "failed to update api key last used time");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pipecd_cache::MemoryHashCache;
    use pipecd_common::model::{ApiKey, Command};
    use pipecd_datastore::Commander;
    use pipecd_filestore::MemoryStore;
    use pipecd_stores::PipedStat;
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    #[tokio::test]
    async fn test_piped_stat_cleaner_keeps_fresh_stats() {
        let hash = Arc::new(MemoryHashCache::new());
        let stats = PipedStatStore::new(hash.clone());
        for (id, ts) in [("old", NOW - 25 * HOUR), ("fresh", NOW - HOUR)] {
            stats
                .put(&PipedStat {
                    piped_id: id.into(),
                    timestamp: ts,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        PipedStatCleaner::new(PipedStatStore::new(hash)).run(NOW).await.unwrap();

        let left: Vec<String> = stats.list().await.unwrap().into_iter().map(|s| s.piped_id).collect();
        assert_eq!(left, vec!["fresh".to_string()]);
    }

    #[tokio::test]
    async fn test_orphan_command_cleaner_times_out_old_commands() {
        let ds = testing::datastore();
        let commands = CommandStore::new(ds.clone(), Commander::Web);
        for (id, created_at) in [("c1", NOW - 25 * HOUR), ("c2", NOW - HOUR), ("c3", NOW - 24 * HOUR)] {
            commands
                .add(Command {
                    id: id.into(),
                    piped_id: "piped".into(),
                    project_id: "p".into(),
                    created_at,
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        OrphanCommandCleaner::new(CommandStore::new(ds, Commander::Ops)).run(NOW).await.unwrap();

        let c1 = commands.get("c1").await.unwrap();
        assert_eq!(c1.status, CommandStatus::CommandTimeout);
        assert_eq!(c1.handled_at, NOW);
        assert_eq!(commands.get("c2").await.unwrap().status, CommandStatus::CommandNotHandledYet);
        assert_eq!(commands.get("c3").await.unwrap().status, CommandStatus::CommandTimeout);
        assert!(commands.list_unhandled_before(NOW - 24 * HOUR + 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_planpreview_cleaner_deletes_expired_outputs() {
        let fs = Arc::new(MemoryStore::new());
        fs.put_at("command-output/old.json", "{}", NOW - 49 * HOUR);
        fs.put_at("command-output/new.json", "{}", NOW - HOUR);

        PlanPreviewOutputCleaner::new(CommandOutputStore::new(fs.clone()))
            .run(NOW)
            .await
            .unwrap();

        assert!(!fs.contains("command-output/old.json"));
        assert!(fs.contains("command-output/new.json"));
    }

    #[tokio::test]
    async fn test_api_key_updater_writes_back_last_used() {
        let ds = testing::datastore();
        let keys = ApiKeyStore::new(ds.clone(), Commander::Web);
        keys.add(ApiKey {
            id: "k1".into(),
            name: "ci".into(),
            key_hash: "hash".into(),
            project_id: "p".into(),
            ..Default::default()
        })
        .await
        .unwrap();

        let hash = Arc::new(MemoryHashCache::new());
        let last_used = ApiKeyLastUsedStore::new(hash.clone());
        last_used.put("k1", NOW).await.unwrap();
        last_used.put("missing", NOW).await.unwrap();

        ApiKeyLastUsedUpdater::new(ApiKeyLastUsedStore::new(hash), ApiKeyStore::new(ds, Commander::Ops))
            .run(NOW)
            .await
            .unwrap();

        assert_eq!(keys.get("k1").await.unwrap().last_used_at, NOW);
    }
}
