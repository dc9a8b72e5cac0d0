//! Opaque objects plugins share between deployments of one application

use bytes::Bytes;
use pipecd_common::{Error, Result};
use pipecd_filestore::Store;
use std::sync::Arc;

pub struct SharedObjectStore {
    fs: Arc<dyn Store>,
}

impl SharedObjectStore {
    pub fn new(fs: Arc<dyn Store>) -> Self {
        Self { fs }
    }

    fn path(application_id: &str, plugin: &str, key: &str) -> Result<String> {
        for (name, part) in [("application id", application_id), ("plugin name", plugin), ("key", key)] {
            if part.is_empty() || part.contains('/') || part == ".." {
                return Err(Error::invalid_argument(format!("invalid {name} {part:?}")));
            }
        }
        Ok(format!("application-shared-objects/{application_id}/{plugin}/{key}.json"))
    }

    pub async fn get(&self, application_id: &str, plugin: &str, key: &str) -> Result<Bytes> {
        self.fs.get(&Self::path(application_id, plugin, key)?).await
    }

    pub async fn put(&self, application_id: &str, plugin: &str, key: &str, object: Bytes) -> Result<()> {
        self.fs.put(&Self::path(application_id, plugin, key)?, object).await
    }
}
