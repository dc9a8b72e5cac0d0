//! In-memory backends for handler tests

use crate::grpc::Deps;
use crate::encryption::Encrypter;
use crate::jwt::JwtManager;
use pipecd_cache::{HashCache, MemoryCache, MemoryHashCache, MemoryHashCaches};
use pipecd_common::ControlPlaneConfig;
use pipecd_datastore::DataStore;
use pipecd_datastore::filedb::FileDb;
use pipecd_filestore::{MemoryStore, Store};
use pipecd_stores::{PipedStatStore, UnregisteredAppStore};
use std::sync::Arc;
use std::time::Duration;

pub fn datastore() -> Arc<dyn DataStore> {
    Arc::new(FileDb::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new(Duration::ZERO)),
    ))
}

pub fn hash_cache() -> Arc<dyn HashCache> {
    Arc::new(MemoryHashCache::new())
}

pub const CONFIG: &str = r"
apiVersion: pipecd.dev/v1beta1
kind: ControlPlane
spec:
  address: https://pipecd.example.com
  stateKey: state
  projects:
    - id: p
      staticAdmin:
        username: admin
        passwordHash: 8c6976e5b5410415bde908bd4dee15dfb167a9c873fc4bb8a81f6f2ab448a918
  datastore:
    type: FILEDB
  filestore:
    type: MINIO
    config:
      endpoint: http://minio:9000
      bucket: pipecd
      accessKeyFile: /etc/minio/access_key
      secretKeyFile: /etc/minio/secret_key
";

pub fn deps() -> Deps {
    let fs: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Deps {
        datastore: datastore(),
        filestore: fs,
        cache: Arc::new(MemoryCache::new(Duration::from_secs(60))),
        piped_stats: Arc::new(PipedStatStore::new(hash_cache())),
        unregistered_apps: Arc::new(UnregisteredAppStore::new(Arc::new(MemoryHashCaches::new(Duration::ZERO)))),
        api_key_last_used: hash_cache(),
        encrypter: Arc::new(Encrypter::new(b"test-key")),
        jwt: Arc::new(JwtManager::new(b"test-key")),
        config: Arc::new(ControlPlaneConfig::parse(CONFIG).unwrap()),
    }
}
