//! PipeCD Filestore - uniform blob I/O
//!
//! Paths are forward-slash joined and relative to the bucket configured for
//! the driver. A missing object is always reported as
//! [`pipecd_common::Error::NotFound`].

pub mod gcs;
pub mod memory;
pub mod minio;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use pipecd_common::config::FileStoreConfig;
use pipecd_common::{Error, Result};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

pub use memory::MemoryStore;

/// Streaming body of an object
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Attributes of a stored object as returned by [`Store::list`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub path: String,
    pub size: u64,
    /// Driver-reported content version; changes on every overwrite
    pub etag: String,
    /// Unix seconds of the last write
    pub updated_at: i64,
}

/// Blob storage
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, path: &str) -> Result<Bytes>;

    async fn get_reader(&self, path: &str) -> Result<ObjectReader>;

    async fn put(&self, path: &str, content: Bytes) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    /// Every object whose path starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the driver selected by the configuration
///
/// The MinIO driver creates its bucket when `autoCreateBucket` is set.
pub async fn open(cfg: &FileStoreConfig) -> Result<Arc<dyn Store>> {
    match cfg {
        FileStoreConfig::Gcs(c) => Ok(Arc::new(gcs::GcsStore::from_config(c)?)),
        FileStoreConfig::S3(c) => Ok(Arc::new(s3::S3Store::from_config(c)?)),
        FileStoreConfig::Minio(c) => {
            let store = minio::MinioStore::from_config(c)?;
            if c.auto_create_bucket {
                store.ensure_bucket().await?;
            }
            Ok(Arc::new(store))
        }
    }
}

/// Map a non-success HTTP response onto an error kind
pub(crate) async fn check_response(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        404 => Error::not_found(what.to_string()),
        401 => Error::unauthenticated(format!("{what}: {body}")),
        403 => Error::permission_denied(format!("{what}: {body}")),
        _ => Error::internal(format!("{what}: unexpected status {status}: {body}")),
    })
}

pub(crate) fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::deadline_exceeded(e.to_string())
    } else {
        Error::internal(e.to_string())
    }
}

/// Adapt a response body into an [`ObjectReader`]
pub(crate) fn body_reader(resp: reqwest::Response) -> ObjectReader {
    use futures::TryStreamExt;
    let stream = resp.bytes_stream().map_err(std::io::Error::other);
    Box::pin(tokio_util::io::StreamReader::new(stream))
}
