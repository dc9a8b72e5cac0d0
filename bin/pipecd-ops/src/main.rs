//! PipeCD ops supervisor
//!
//! Runs the control-plane background jobs next to the ops HTTP surface and
//! the admin server, all in one fail-fast group.

mod chain;
mod http;
mod insight;
mod janitor;
mod schedule;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use chain::{CHAIN_SYNC_INTERVAL, ChainController};
use clap::Parser;
use insight::InsightCollector;
use janitor::{
    API_KEY_LAST_USED_INTERVAL, ApiKeyLastUsedUpdater, ORPHAN_COMMAND_CLEAN_INTERVAL, OrphanCommandCleaner,
    PIPED_STAT_CLEAN_INTERVAL, PLANPREVIEW_CLEAN_SCHEDULE, PipedStatCleaner, PlanPreviewOutputCleaner,
};
use pipecd_cache::{Cache, PoolConfig, RedisConnector, RedisHashCache, RedisTtlCache};
use pipecd_common::{ControlPlaneConfig, DataStoreConfig};
use pipecd_datastore::{ApiKeyStore, CommandStore, Commander, DataStore, ProjectStore};
use pipecd_ensurer::{Gcloud, IndexEnsurer, SqlEnsurer};
use pipecd_runtime::{AdminServer, Group, LogArgs};
use pipecd_stores::apikey::API_KEYS_KEY;
use pipecd_stores::piped_stat::PIPED_STATS_KEY;
use pipecd_stores::{ApiKeyLastUsedStore, CommandOutputStore, InsightStore, PipedStatStore};
use schedule::Job;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

const FILESTORE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pipecd-ops")]
#[command(about = "PipeCD ops supervisor")]
#[command(version)]
struct Args {
    /// Port of the ops HTTP server
    #[arg(long, default_value_t = 9082)]
    http_port: u16,

    /// Port of the admin server
    #[arg(long, default_value_t = 9085)]
    admin_port: u16,

    /// How long servers drain in-flight work after a shutdown signal
    #[arg(long, default_value = "15s", value_parser = pipecd_common::duration::parse_duration)]
    grace_period: Duration,

    /// Control-plane configuration file
    #[arg(long)]
    config_file: PathBuf,

    /// Path to the gcloud executable used to manage Firestore indexes
    #[arg(long, default_value = "gcloud")]
    gcloud_path: PathBuf,

    /// Address of the redis cache
    #[arg(long, default_value = "cache:6379")]
    cache_address: String,

    #[command(flatten)]
    log: LogArgs,
}

fn spawn_every(group: &mut Group, job: Arc<dyn Job>, interval: Duration) {
    group.spawn(job.name(), move |token| schedule::every(job, interval, token));
}

fn spawn_cron(group: &mut Group, job: Arc<dyn Job>, expr: String) {
    group.spawn(job.name(), move |token| async move { schedule::cron(job, &expr, token).await });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    pipecd_runtime::logging::init(&args.log);
    info!(version = env!("CARGO_PKG_VERSION"), "starting pipecd ops");

    let metrics = pipecd_runtime::metrics::install_recorder()?;
    let root = pipecd_runtime::root_token();
    let mut group = Group::new(&root);

    let config = ControlPlaneConfig::load_from_file(&args.config_file)?;

    let redis = RedisConnector::pool(&args.cache_address, None, PoolConfig::from(&config.spec.cache.pool))?;
    let cache: Arc<dyn Cache> = Arc::new(RedisTtlCache::new(redis.clone(), config.spec.cache.ttl_duration()));

    let filestore = tokio::time::timeout(FILESTORE_OPEN_TIMEOUT, pipecd_filestore::open(&config.spec.filestore))
        .await
        .context("timed out opening the filestore")??;

    let datastore: Arc<dyn DataStore> = match &config.spec.datastore {
        DataStoreConfig::MySql(c) => {
            let mysql = pipecd_datastore::mysql::MySql::connect(c)?;
            SqlEnsurer::new(mysql.pool().clone()).ensure().await?;
            Arc::new(mysql)
        }
        DataStoreConfig::Firestore(c) => {
            let ensurer = IndexEnsurer::new(Gcloud::new(&args.gcloud_path), c);
            group.spawn("index-ensurer", |_| async move {
                match ensurer.ensure().await {
                    Ok(created) => info!(created, "firestore indexes are ready"),
                    Err(e) => error!(error = %e, "failed to ensure firestore indexes"),
                }
                Ok(())
            });
            pipecd_datastore::open(&config.spec.datastore, filestore.clone(), cache.clone()).await?
        }
        DataStoreConfig::FileDb(_) => {
            pipecd_datastore::open(&config.spec.datastore, filestore.clone(), cache.clone()).await?
        }
    };

    spawn_every(
        &mut group,
        Arc::new(PipedStatCleaner::new(PipedStatStore::new(Arc::new(RedisHashCache::new(
            redis.clone(),
            PIPED_STATS_KEY,
        ))))),
        PIPED_STAT_CLEAN_INTERVAL,
    );
    spawn_every(
        &mut group,
        Arc::new(OrphanCommandCleaner::new(CommandStore::new(datastore.clone(), Commander::Ops))),
        ORPHAN_COMMAND_CLEAN_INTERVAL,
    );
    spawn_cron(
        &mut group,
        Arc::new(PlanPreviewOutputCleaner::new(CommandOutputStore::new(filestore.clone()))),
        PLANPREVIEW_CLEAN_SCHEDULE.to_string(),
    );
    spawn_every(
        &mut group,
        Arc::new(ApiKeyLastUsedUpdater::new(
            ApiKeyLastUsedStore::new(Arc::new(RedisHashCache::new(redis, API_KEYS_KEY))),
            ApiKeyStore::new(datastore.clone(), Commander::Ops),
        )),
        API_KEY_LAST_USED_INTERVAL,
    );
    spawn_every(&mut group, Arc::new(ChainController::new(&datastore)), CHAIN_SYNC_INTERVAL);

    let collector_cfg = config.spec.insight_collector.deployment.clone();
    if collector_cfg.enabled {
        let collector = InsightCollector::new(&datastore, InsightStore::new(filestore), collector_cfg);
        let expr = collector.schedule().to_string();
        spawn_cron(&mut group, Arc::new(collector), expr);
    } else {
        info!("insight collector is disabled");
    }

    let ops_state = http::OpsState {
        projects: Arc::new(ProjectStore::new(datastore, Commander::Ops)),
        shared_sso_configs: Arc::new(config.spec.shared_sso_configs.clone()),
    };
    let ops_router = http::router(ops_state);
    let grace = args.grace_period;
    let http_addr = SocketAddr::from(([0, 0, 0, 0], args.http_port));
    group.spawn("http", move |token| {
        pipecd_runtime::serve::serve_http("ops-http", http_addr, ops_router, token, grace)
    });

    let admin = AdminServer::new(args.admin_port, "pipecd-ops", env!("CARGO_PKG_VERSION")).with_metrics(metrics);
    group.spawn("admin", move |token| admin.run(token, grace));

    group.wait().await?;
    info!("pipecd ops stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_defaults() {
        let args = Args::try_parse_from(["pipecd-ops", "--config-file", "cp.yaml"]).unwrap();
        assert_eq!(args.http_port, 9082);
        assert_eq!(args.admin_port, 9085);
        assert_eq!(args.grace_period, Duration::from_secs(15));
        assert_eq!(args.gcloud_path, PathBuf::from("gcloud"));
        assert_eq!(args.cache_address, "cache:6379");
    }

    #[test]
    fn test_grace_period_accepts_compound_durations() {
        let args = Args::try_parse_from(["pipecd-ops", "--config-file", "cp.yaml", "--grace-period", "1m30s"]).unwrap();
        assert_eq!(args.grace_period, Duration::from_secs(90));
        assert!(Args::try_parse_from(["pipecd-ops", "--config-file", "cp.yaml", "--grace-period", "soon"]).is_err());
    }
}
