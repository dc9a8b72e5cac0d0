//! PipeCD control-plane server
//!
//! Hosts the piped, web, external and ext-authz gRPC APIs, the HTTP surface
//! and the admin server in one fail-fast group.

mod auth;
mod encryption;
mod grpc;
mod http;
mod jwt;
mod rbac;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use auth::{ApiKeyAuth, PipedTokenAuth, WebAuth};
use clap::Parser;
use encryption::Encrypter;
use grpc::api::Api;
use grpc::authz::AuthzApi;
use grpc::piped_api::PipedApi;
use grpc::web_api::WebApi;
use grpc::{Deps, ServeOptions};
use jwt::JwtManager;
use pipecd_cache::{Cache, PoolConfig, RedisConnector, RedisHashCache, RedisHashCaches, RedisTtlCache};
use pipecd_common::{ControlPlaneConfig, DataStoreConfig};
use pipecd_datastore::{ApiKeyStore, Commander, DataStore, PipedStore, ProjectStore};
use pipecd_ensurer::{Gcloud, IndexEnsurer, SqlEnsurer};
use pipecd_runtime::{AdminServer, Group, LogArgs};
use pipecd_stores::apikey::API_KEYS_KEY;
use pipecd_stores::piped_stat::PIPED_STATS_KEY;
use pipecd_stores::{ApiKeyLastUsedStore, PipedStatStore, UnregisteredAppStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::{Identity, ServerTlsConfig};
use tracing::{error, info};

const FILESTORE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "pipecd-server")]
#[command(about = "PipeCD control-plane server")]
#[command(version)]
struct Args {
    /// Port of the gRPC API used by pipeds
    #[arg(long, default_value_t = 9080)]
    piped_api_port: u16,

    /// Port of the gRPC API used by the web console
    #[arg(long, default_value_t = 9081)]
    web_api_port: u16,

    /// Port of the HTTP server
    #[arg(long, default_value_t = 9082)]
    http_port: u16,

    /// Port of the gRPC API used by pipectl and CI
    #[arg(long, default_value_t = 9083)]
    api_port: u16,

    /// Port of the admin server
    #[arg(long, default_value_t = 9085)]
    admin_port: u16,

    /// Port of the envoy external authorization API
    #[arg(long, default_value_t = 9086)]
    envoy_authz_port: u16,

    /// Directory of the web console assets
    #[arg(long, default_value = "web/static")]
    static_dir: PathBuf,

    /// Address of the redis cache
    #[arg(long, default_value = "cache:6379")]
    cache_address: String,

    /// How long servers drain in-flight work after a shutdown signal
    #[arg(long, default_value = "30s", value_parser = pipecd_common::duration::parse_duration)]
    grace_period: Duration,

    /// Serve the gRPC APIs over TLS
    #[arg(long, default_value_t = false)]
    tls: bool,

    /// TLS certificate file
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// TLS key file
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// Issue login cookies without the Secure attribute
    #[arg(long, default_value_t = false)]
    insecure_cookie: bool,

    /// File holding the key used to sign tokens and encrypt secrets
    #[arg(long)]
    encryption_key_file: PathBuf,

    /// Control-plane configuration file
    #[arg(long)]
    config_file: PathBuf,

    /// Path to the gcloud executable used to manage Firestore indexes
    #[arg(long, default_value = "gcloud")]
    gcloud_path: PathBuf,

    /// Register gRPC reflection on the piped, web and authz APIs
    #[arg(long, default_value_t = false)]
    enable_grpc_reflection: bool,

    #[command(flatten)]
    log: LogArgs,
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

fn tls_config(args: &Args) -> Result<Option<ServerTlsConfig>> {
    if !args.tls {
        return Ok(None);
    }
    let (Some(cert), Some(key)) = (&args.cert_file, &args.key_file) else {
        anyhow::bail!("--cert-file and --key-file are required when --tls is set");
    };
    let cert = std::fs::read(cert).with_context(|| format!("failed to read {}", cert.display()))?;
    let key = std::fs::read(key).with_context(|| format!("failed to read {}", key.display()))?;
    Ok(Some(ServerTlsConfig::new().identity(Identity::from_pem(cert, key))))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    pipecd_runtime::logging::init(&args.log);
    info!(version = env!("CARGO_PKG_VERSION"), "starting pipecd server");

    let metrics = pipecd_runtime::metrics::install_recorder()?;
    let root = pipecd_runtime::root_token();
    let mut group = Group::new(&root);

    let config = Arc::new(ControlPlaneConfig::load_from_file(&args.config_file)?);
    info!(
        datastore = config.spec.datastore.type_name(),
        projects = config.spec.projects.len(),
        "loaded control-plane configuration"
    );

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
                // Index creation is slow and only affects query latency
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

    let key = Encrypter::load_key(&args.encryption_key_file)?;
    let api_key_last_used = Arc::new(RedisHashCache::new(redis.clone(), API_KEYS_KEY));
    let deps = Deps {
        datastore: datastore.clone(),
        filestore,
        cache,
        piped_stats: Arc::new(PipedStatStore::new(Arc::new(RedisHashCache::new(redis.clone(), PIPED_STATS_KEY)))),
        unregistered_apps: Arc::new(UnregisteredAppStore::new(Arc::new(RedisHashCaches::new(
            redis,
            Duration::ZERO,
        )))),
        api_key_last_used: api_key_last_used.clone(),
        encrypter: Arc::new(Encrypter::new(&key)),
        jwt: Arc::new(JwtManager::new(&key)),
        config: config.clone(),
    };

    let piped_auth = Arc::new(PipedTokenAuth::new(Arc::new(PipedStore::new(
        datastore.clone(),
        Commander::Piped,
    ))));
    let api_key_auth = Arc::new(ApiKeyAuth::new(
        Arc::new(ApiKeyStore::new(datastore.clone(), Commander::Pipectl)),
        ApiKeyLastUsedStore::new(api_key_last_used),
    ));
    let web_auth = Arc::new(WebAuth::new(deps.jwt.clone()));

    let opts = ServeOptions {
        tls: tls_config(&args)?,
        reflection: args.enable_grpc_reflection,
    };
    let grace = args.grace_period;

    let piped_routes = grpc::routes(PipedApi::new(&deps, piped_auth.clone()).into_server(), opts.reflection)?;
    let web_routes = grpc::routes(WebApi::new(&deps, web_auth).into_server(), opts.reflection)?;
    let api_routes = grpc::routes(Api::new(&deps, api_key_auth).into_server(), false)?;
    let authz_routes = grpc::routes(AuthzApi::new(piped_auth).into_server(), opts.reflection)?;

    for (name, port, routes) in [
        ("piped-api", args.piped_api_port, piped_routes),
        ("web-api", args.web_api_port, web_routes),
        ("api", args.api_port, api_routes),
        ("envoy-authz", args.envoy_authz_port, authz_routes),
    ] {
        let tls = opts.tls.clone();
        group.spawn(name, move |token| grpc::serve(name, addr(port), routes, tls, token, grace));
    }

    let http_state = http::HttpState {
        config,
        projects: Arc::new(ProjectStore::new(datastore, Commander::Web)),
        jwt: deps.jwt.clone(),
        secure_cookie: !args.insecure_cookie,
    };
    let http_router = http::router(http_state, &args.static_dir);
    let http_port = args.http_port;
    group.spawn("http", move |token| {
        pipecd_runtime::serve::serve_http("http", addr(http_port), http_router, token, grace)
    });

    let admin = AdminServer::new(args.admin_port, "pipecd-server", env!("CARGO_PKG_VERSION")).with_metrics(metrics);
    group.spawn("admin", move |token| admin.run(token, grace));

    group.wait().await?;
    info!("pipecd server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 5] = ["pipecd-server", "--config-file", "cp.yaml", "--encryption-key-file", "key"];

    #[test]
    fn test_flag_defaults() {
        let args = Args::try_parse_from(REQUIRED).unwrap();
        assert_eq!(args.gcloud_path, PathBuf::from("gcloud"));
        assert_eq!(args.grace_period, Duration::from_secs(30));
        assert_eq!(args.piped_api_port, 9080);
        assert_eq!(args.envoy_authz_port, 9086);
    }

    #[test]
    fn test_gcloud_path_flag() {
        let args = Args::try_parse_from(REQUIRED.into_iter().chain(["--gcloud-path", "/opt/gcloud/bin/gcloud"])).unwrap();
        assert_eq!(args.gcloud_path, PathBuf::from("/opt/gcloud/bin/gcloud"));
    }

    #[test]
    fn test_required_flags() {
        assert!(Args::try_parse_from(["pipecd-server", "--config-file", "cp.yaml"]).is_err());
    }
}
