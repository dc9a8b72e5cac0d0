//! Control-plane configuration
//!
//! The control plane is configured by a single YAML document:
//!
//! ```yaml
//! apiVersion: pipecd.dev/v1beta1
//! kind: ControlPlane
//! spec:
//!   stateKey: random-string
//!   datastore:
//!     type: MYSQL
//!     config:
//!       url: mysql://root@mysql:3306
//!       database: pipecd
//!   filestore:
//!     type: MINIO
//!     config:
//!       endpoint: http://minio:9000
//!       bucket: pipecd
//! ```

use crate::duration::Duration;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Expected value of the top-level `kind` field
pub const CONTROL_PLANE_KIND: &str = "ControlPlane";

const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Root of the control-plane configuration file
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    pub spec: ControlPlaneSpec,
}

impl ControlPlaneConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse(&data)
    }

    /// Parse and validate a configuration document
    pub fn parse(data: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(data)
            .map_err(|e| Error::configuration(format!("failed to parse control-plane config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kind != CONTROL_PLANE_KIND {
            return Err(Error::configuration(format!(
                "wrong configuration kind for control-plane: {:?}, expected {CONTROL_PLANE_KIND:?}",
                self.kind
            )));
        }
        self.spec.validate()
    }
}

/// Control-plane specification
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneSpec {
    /// Public address of the control plane, used in links and cookies
    pub address: String,
    /// Random key used to sign OAuth state parameters
    pub state_key: String,
    /// SSO configurations shared between projects
    #[serde(rename = "sharedSSOConfigs")]
    pub shared_sso_configs: Vec<SharedSsoConfig>,
    /// Projects bootstrapped from the configuration file
    pub projects: Vec<ControlPlaneProject>,
    pub datastore: DataStoreConfig,
    pub filestore: FileStoreConfig,
    pub cache: CacheConfig,
    pub insight_collector: InsightCollectorConfig,
}

impl ControlPlaneSpec {
    fn validate(&self) -> Result<()> {
        for p in &self.projects {
            if p.id.is_empty() {
                return Err(Error::configuration("project id must not be empty"));
            }
        }
        for s in &self.shared_sso_configs {
            if s.name.is_empty() {
                return Err(Error::configuration("name field in sharedSSOConfigs is required"));
            }
        }
        self.insight_collector.validate()
    }

    pub fn find_project(&self, id: &str) -> Option<&ControlPlaneProject> {
        self.projects.iter().find(|p| p.id == id)
    }

    pub fn project_map(&self) -> BTreeMap<String, ControlPlaneProject> {
        self.projects.iter().map(|p| (p.id.clone(), p.clone())).collect()
    }

    pub fn shared_sso_config(&self, name: &str) -> Option<&SharedSsoConfig> {
        self.shared_sso_configs.iter().find(|s| s.name == name)
    }
}

/// A project declared in the configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlPlaneProject {
    pub id: String,
    pub desc: String,
    pub static_admin: ProjectStaticUser,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectStaticUser {
    pub username: String,
    /// Hex encoded SHA-256 of the password
    pub password_hash: String,
}

/// SSO configuration that projects can reference by name
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SharedSsoConfig {
    pub name: String,
    pub provider: String,
    /// Provider specific settings, handed to the SSO layer untouched
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

// ---- Datastore ----

/// Datastore driver selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawDriverConfig", into = "RawDriverConfig")]
pub enum DataStoreConfig {
    Firestore(FirestoreConfig),
    MySql(MySqlConfig),
    FileDb(FileDbConfig),
}

impl Default for DataStoreConfig {
    fn default() -> Self {
        Self::FileDb(FileDbConfig::default())
    }
}

impl DataStoreConfig {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Firestore(_) => "FIRESTORE",
            Self::MySql(_) => "MYSQL",
            Self::FileDb(_) => "FILEDB",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FirestoreConfig {
    /// Prefix for all collections, `<namespace>/<environment>/<kind>`
    pub namespace: String,
    pub environment: String,
    /// Prepended to collection names when creating composite indexes
    pub collection_name_prefix: String,
    /// GCP project hosting the Firestore database
    pub project: String,
    /// Service-account credentials; metadata server is used when empty
    pub credentials_file: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MySqlConfig {
    /// Connection URL without credentials, e.g. `mysql://mysql:3306`
    pub url: String,
    pub database: String,
    pub username_file: String,
    pub password_file: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileDbConfig {}

// ---- Filestore ----

/// Filestore driver selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawDriverConfig", into = "RawDriverConfig")]
pub enum FileStoreConfig {
    Gcs(GcsConfig),
    S3(S3Config),
    Minio(MinioConfig),
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self::Minio(MinioConfig::default())
    }
}

impl FileStoreConfig {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Gcs(_) => "GCS",
            Self::S3(_) => "S3",
            Self::Minio(_) => "MINIO",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcsConfig {
    pub bucket: String,
    pub credentials_file: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Shared credentials file holding `aws_access_key_id`/`aws_secret_access_key`
    pub credentials_file: String,
    pub profile: String,
    /// Overrides the regional endpoint, mainly for S3-compatible services
    pub endpoint: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MinioConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_file: String,
    pub secret_key_file: String,
    /// Create the bucket on startup when it does not exist
    pub auto_create_bucket: bool,
}

/// Shape shared by `datastore` and `filestore` blocks
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RawDriverConfig {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    config: serde_json::Value,
}

impl RawDriverConfig {
    fn decode<T: serde::de::DeserializeOwned + Default>(&self) -> std::result::Result<T, String> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.config.clone())
            .map_err(|e| format!("invalid {} config: {e}", self.kind))
    }

    fn encode<T: Serialize>(kind: &str, cfg: &T) -> Self {
        Self {
            kind: kind.to_string(),
            config: serde_json::to_value(cfg).unwrap_or_default(),
        }
    }
}

impl TryFrom<RawDriverConfig> for DataStoreConfig {
    type Error = String;

    fn try_from(raw: RawDriverConfig) -> std::result::Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "FIRESTORE" => raw.decode().map(Self::Firestore),
            "MYSQL" => raw.decode().map(Self::MySql),
            "FILEDB" => raw.decode().map(Self::FileDb),
            other => Err(format!("unknown datastore type {other:?}")),
        }
    }
}

impl From<DataStoreConfig> for RawDriverConfig {
    fn from(cfg: DataStoreConfig) -> Self {
        let kind = cfg.type_name();
        match &cfg {
            DataStoreConfig::Firestore(c) => Self::encode(kind, c),
            DataStoreConfig::MySql(c) => Self::encode(kind, c),
            DataStoreConfig::FileDb(c) => Self::encode(kind, c),
        }
    }
}

impl TryFrom<RawDriverConfig> for FileStoreConfig {
    type Error = String;

    fn try_from(raw: RawDriverConfig) -> std::result::Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "GCS" => raw.decode().map(Self::Gcs),
            "S3" => raw.decode().map(Self::S3),
            "MINIO" => raw.decode().map(Self::Minio),
            other => Err(format!("unknown filestore type {other:?}")),
        }
    }
}

impl From<FileStoreConfig> for RawDriverConfig {
    fn from(cfg: FileStoreConfig) -> Self {
        let kind = cfg.type_name();
        match &cfg {
            FileStoreConfig::Gcs(c) => Self::encode(kind, c),
            FileStoreConfig::S3(c) => Self::encode(kind, c),
            FileStoreConfig::Minio(c) => Self::encode(kind, c),
        }
    }
}

// ---- Cache ----

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// TTL of datastore read-through entries
    pub ttl: Duration,
    /// Redis connection pool; unset fields keep the pool defaults
    pub pool: CachePoolConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_CACHE_TTL,
            pool: CachePoolConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachePoolConfig {
    /// Idle connections kept for reuse
    pub max_idle: Option<usize>,
    /// Connections in use at once; 0 lifts the bound
    pub max_active: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub conn_check_interval: Option<Duration>,
    pub dial_timeout: Option<Duration>,
}

impl CacheConfig {
    /// Configured TTL, falling back to 5 minutes when zero
    pub fn ttl_duration(&self) -> std::time::Duration {
        if self.ttl == Duration::ZERO {
            DEFAULT_CACHE_TTL.as_std()
        } else {
            self.ttl.as_std()
        }
    }
}

// ---- Insight collector ----

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightCollectorConfig {
    pub deployment: InsightCollectorDeployment,
}

impl InsightCollectorConfig {
    fn validate(&self) -> Result<()> {
        if self.deployment.enabled && self.deployment.schedule.split_whitespace().count() != 5 {
            return Err(Error::configuration(format!(
                "invalid insightCollector.deployment.schedule {:?}",
                self.deployment.schedule
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InsightCollectorDeployment {
    pub enabled: bool,
    /// Cron expression (5 fields)
    pub schedule: String,
    pub retries: u32,
}

impl Default for InsightCollectorDeployment {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: "0 10 * * *".to_string(),
            retries: 3,
        }
    }
}
