//! MinIO driver
//!
//! MinIO speaks the S3 protocol with path-style addressing against an
//! explicit endpoint. Keys are read from files mounted as secrets.

use crate::s3::{Addressing, S3Client};
use crate::{ObjectAttrs, ObjectReader, Store, body_reader, http_error};
use async_trait::async_trait;
use bytes::Bytes;
use pipecd_common::config::MinioConfig;
use pipecd_common::sigv4::Credentials;
use pipecd_common::{Error, Result};
use tracing::info;

const MINIO_REGION: &str = "us-east-1";

pub struct MinioStore {
    client: S3Client,
}

impl MinioStore {
    pub fn from_config(cfg: &MinioConfig) -> Result<Self> {
        if cfg.endpoint.is_empty() || cfg.bucket.is_empty() {
            return Err(Error::configuration("minio endpoint and bucket must be set"));
        }
        let credentials = Credentials::from_key_files(&cfg.access_key_file, &cfg.secret_key_file)?;
        Self::new(&cfg.endpoint, &cfg.bucket, credentials)
    }

    pub fn new(endpoint: &str, bucket: &str, credentials: Credentials) -> Result<Self> {
        Ok(Self {
            client: S3Client::new(endpoint, bucket, MINIO_REGION, Addressing::Path, credentials)?,
        })
    }

    /// Create the bucket unless it already exists
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        match self.client.create_bucket().await {
            Ok(()) => {
                info!(bucket = self.client.bucket(), "created minio bucket");
                Ok(())
            }
            Err(e) if e.is_already_exists() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Store for MinioStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.client.get_object(path).await?.bytes().await.map_err(http_error)
    }

    async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        Ok(body_reader(self.client.get_object(path).await?))
    }

    async fn put(&self, path: &str, content: Bytes) -> Result<()> {
        self.client.put_object(path, content).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client.delete_object(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        self.client.list_objects(prefix).await
    }
}
