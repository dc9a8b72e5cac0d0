//! In-memory filestore
//!
//! Backs tests of everything layered over the filestore. Each write bumps a
//! generation counter that becomes the object's etag.

use crate::{ObjectAttrs, ObjectReader, Store};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use pipecd_common::{Error, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, Debug)]
struct Object {
    data: Bytes,
    etag: String,
    updated_at: i64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Object>>,
    generation: AtomicU64,
    gets: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an object with an explicit modification time
    pub fn put_at(&self, path: &str, content: impl Into<Bytes>, updated_at: i64) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.objects.write().insert(
            path.to_string(),
            Object {
                data: content.into(),
                etag: format!("g{generation}"),
                updated_at,
            },
        );
    }

    /// Number of `get`/`get_reader` calls served so far
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.read().contains_key(path)
    }

    fn read(&self, path: &str) -> Result<Bytes> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.objects
            .read()
            .get(path)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::not_found(path.to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &str) -> Result<Bytes> {
        self.read(path)
    }

    async fn get_reader(&self, path: &str) -> Result<ObjectReader> {
        let data = self.read(path)?;
        Ok(Box::pin(std::io::Cursor::new(data)))
    }

    async fn put(&self, path: &str, content: Bytes) -> Result<()> {
        self.put_at(path, content, chrono::Utc::now().timestamp());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .write()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::not_found(path.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectAttrs {
                path: k.clone(),
                size: o.data.len() as u64,
                etag: o.etag.clone(),
                updated_at: o.updated_at,
            })
            .collect())
    }
}
