//! FileDB: entities as sharded JSON blobs on the filestore
//!
//! Layout is `datastore/<kind>/<shard>/<id>.json`. Every blob read goes
//! through an object cache keyed `FILEDB:OBJECT:<shard>:<id>` holding the
//! blob etag and data; a cached entry is only served when its etag equals the
//! one the filestore lists for the blob.

use crate::filter::{cmp_keys, sort_key};
use crate::{Collection, DataStore, ListOptions, Page, Shard, Updater, decode_error};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use pipecd_cache::Cache;
use pipecd_common::{Error, Result};
use pipecd_filestore::{ObjectAttrs, Store};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const ROOT: &str = "datastore";
const LOAD_CONCURRENCY: usize = 16;

#[derive(Serialize, Deserialize)]
struct CachedObject {
    etag: String,
    data: Value,
}

pub struct FileDb {
    fs: Arc<dyn Store>,
    cache: Arc<dyn Cache>,
}

fn shard_dir(kind: &str, shard: Shard) -> String {
    format!("{ROOT}/{kind}/{shard}/")
}

fn object_path(kind: &str, shard: Shard, id: &str) -> String {
    format!("{ROOT}/{kind}/{shard}/{id}.json")
}

fn cache_key(shard: Shard, id: &str) -> String {
    format!("FILEDB:OBJECT:{shard}:{id}")
}

/// Entity id from a blob path under `dir`
fn id_from_path<'a>(dir: &str, path: &'a str) -> Option<&'a str> {
    let name = path.strip_prefix(dir)?.strip_suffix(".json")?;
    (!name.is_empty() && !name.contains('/')).then_some(name)
}

impl FileDb {
    pub fn new(fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Self {
        Self { fs, cache }
    }

    /// Read one listed blob, preferring the cached copy with a matching etag
    async fn load(&self, shard: Shard, id: &str, attrs: &ObjectAttrs) -> Result<Value> {
        let key = cache_key(shard, id);
        match self.cache.get(&key).await {
            Ok(raw) => match serde_json::from_slice::<CachedObject>(&raw) {
                Ok(obj) if obj.etag == attrs.etag => {
                    metrics::counter!("filedb_object_cache_total", "result" => "hit").increment(1);
                    return Ok(obj.data);
                }
                Ok(_) => debug!(key = %key, "cached object etag is stale"),
                Err(e) => warn!(key = %key, error = %e, "dropping undecodable cached object"),
            },
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(key = %key, error = %e, "failed to read object cache"),
        }
        metrics::counter!("filedb_object_cache_total", "result" => "miss").increment(1);

        let raw = self.fs.get(&attrs.path).await?;
        let data: Value = serde_json::from_slice(&raw).map_err(|e| decode_error(shard.as_str(), id, &e))?;
        let cached = CachedObject {
            etag: attrs.etag.clone(),
            data,
        };
        match serde_json::to_vec(&cached) {
            Ok(buf) => {
                if let Err(e) = self.cache.put(&key, &buf).await {
                    warn!(key = %key, error = %e, "failed to write object cache");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "failed to encode cached object"),
        }
        Ok(cached.data)
    }

    /// Every shard part of every entity of the collection
    async fn load_all(&self, col: &dyn Collection) -> Result<BTreeMap<String, Vec<(Shard, Value)>>> {
        let mut listed = Vec::new();
        for shard in col.shards() {
            let dir = shard_dir(col.kind(), *shard);
            for attrs in self.fs.list(&dir).await? {
                if let Some(id) = id_from_path(&dir, &attrs.path) {
                    listed.push((*shard, id.to_string(), attrs));
                }
            }
        }

        let loaded: Vec<Option<(Shard, String, Value)>> = futures::stream::iter(listed)
            .map(|(shard, id, attrs)| async move {
                match self.load(shard, &id, &attrs).await {
                    Ok(v) => Ok(Some((shard, id, v))),
                    // Deleted between list and read
                    Err(e) if e.is_not_found() => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .buffer_unordered(LOAD_CONCURRENCY)
            .try_collect()
            .await?;

        let mut grouped: BTreeMap<String, Vec<(Shard, Value)>> = BTreeMap::new();
        for (shard, id, value) in loaded.into_iter().flatten() {
            grouped.entry(id).or_default().push((shard, value));
        }
        Ok(grouped)
    }
}

fn encode_cursor(key: &[Value]) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(key)?))
}

fn decode_cursor(cursor: &str) -> Result<Vec<Value>> {
    let raw = URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|e| Error::invalid_argument(format!("malformed cursor: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::invalid_argument(format!("malformed cursor: {e}")))
}

#[async_trait]
impl DataStore for FileDb {
    async fn find(&self, col: &dyn Collection, opts: &ListOptions) -> Result<Page> {
        let grouped = self.load_all(col).await?;

        let mut entities = Vec::with_capacity(grouped.len());
        for (_, parts) in grouped {
            let entity = col.decode(parts)?;
            if col.matches(&entity, &opts.filters)? {
                entities.push((sort_key(&entity, &opts.orders), entity));
            }
        }
        entities.sort_by(|(a, _), (b, _)| cmp_keys(a, b, &opts.orders));

        if !opts.cursor.is_empty() {
            let after = decode_cursor(&opts.cursor)?;
            entities.retain(|(k, _)| cmp_keys(k, &after, &opts.orders).is_gt());
        }

        let more = opts.limit > 0 && entities.len() > opts.limit;
        if opts.limit > 0 {
            entities.truncate(opts.limit);
        }
        let cursor = match (more, entities.last()) {
            (true, Some((key, _))) => encode_cursor(key)?,
            _ => String::new(),
        };
        Ok(Page {
            entities: entities.into_iter().map(|(_, e)| e).collect(),
            cursor,
        })
    }

    async fn get(&self, col: &dyn Collection, id: &str) -> Result<Value> {
        let mut parts = Vec::with_capacity(col.shards().len());
        for shard in col.shards() {
            let path = object_path(col.kind(), *shard, id);
            let listed = self.fs.list(&path).await?;
            let Some(attrs) = listed.into_iter().find(|a| a.path == path) else {
                continue;
            };
            match self.load(*shard, id, &attrs).await {
                Ok(v) => parts.push((*shard, v)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if parts.is_empty() {
            return Err(Error::not_found(format!("{} {id}", col.kind())));
        }
        col.decode(parts)
    }

    async fn create(&self, col: &dyn Collection, id: &str, entity: &Value) -> Result<()> {
        let parts = col.encode(entity)?;
        for (shard, _) in &parts {
            match self.fs.get(&object_path(col.kind(), *shard, id)).await {
                Ok(_) => return Err(Error::already_exists(format!("{} {id}", col.kind()))),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        for (shard, data) in parts {
            self.fs
                .put(&object_path(col.kind(), shard, id), Bytes::from(data))
                .await?;
        }
        Ok(())
    }

    async fn update(&self, col: &dyn Collection, id: &str, updater: Updater<'_>) -> Result<()> {
        let shard = col.updatable_shard()?;
        if !col.shards().contains(&shard) {
            return Err(Error::unsupported(format!(
                "shard {shard} is not used by {}",
                col.kind()
            )));
        }
        let path = object_path(col.kind(), shard, id);
        let raw = self.fs.get(&path).await?;
        let mut entity: Value = serde_json::from_slice(&raw).map_err(|e| decode_error(col.kind(), id, &e))?;
        updater(&mut entity)?;
        self.fs.put(&path, Bytes::from(serde_json::to_vec(&entity)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Commander, Operator, Order, collection_for};
    use pipecd_cache::MemoryCache;
    use pipecd_common::model::{Application, Deployment};
    use pipecd_filestore::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, Arc<MemoryCache>, FileDb) {
        let fs = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new(Duration::ZERO));
        let db = FileDb::new(fs.clone(), cache.clone());
        (fs, cache, db)
    }

    async fn put_json(fs: &MemoryStore, path: &str, v: &Value) {
        fs.put(path, Bytes::from(serde_json::to_vec(v).unwrap())).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_merges_application_shards() {
        let (fs, _, db) = setup();
        put_json(
            &fs,
            "datastore/Application/client/A.json",
            &json!({"id": "A", "name": "x", "updatedAt": 10}),
        )
        .await;
        put_json(
            &fs,
            "datastore/Application/agent/A.json",
            &json!({"id": "A", "syncState": {"status": "SYNCED"}, "updatedAt": 20}),
        )
        .await;

        let col = collection_for::<Application>(Commander::Web);
        let got = db.get(col.as_ref(), "A").await.unwrap();
        assert_eq!(got["name"], "x");
        assert_eq!(got["syncState"]["status"], "SYNCED");
        assert_eq!(got["updatedAt"], 20);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_, _, db) = setup();
        let col = collection_for::<Application>(Commander::Web);
        assert!(db.get(col.as_ref(), "nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_object_cache_honours_etag() {
        let (fs, _, db) = setup();
        let col = collection_for::<Deployment>(Commander::Piped);
        put_json(&fs, "datastore/Deployment/agent/D.json", &json!({"id": "D", "summary": "one"})).await;

        assert_eq!(db.get(col.as_ref(), "D").await.unwrap()["summary"], "one");
        assert_eq!(db.get(col.as_ref(), "D").await.unwrap()["summary"], "one");
        assert_eq!(fs.get_count(), 1, "second read served from cache");

        put_json(&fs, "datastore/Deployment/agent/D.json", &json!({"id": "D", "summary": "two"})).await;
        assert_eq!(db.get(col.as_ref(), "D").await.unwrap()["summary"], "two");
        assert_eq!(fs.get_count(), 2);
    }

    #[tokio::test]
    async fn test_create_then_duplicate() {
        let (fs, _, db) = setup();
        let col = collection_for::<Application>(Commander::Web);
        let app = json!({"id": "A", "name": "x"});
        db.create(col.as_ref(), "A", &app).await.unwrap();
        assert!(fs.contains("datastore/Application/client/A.json"));
        assert!(fs.contains("datastore/Application/agent/A.json"));
        let err = db.create(col.as_ref(), "A", &app).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_writes_only_commander_shard() {
        let (fs, _, db) = setup();
        let web = collection_for::<Application>(Commander::Web);
        db.create(web.as_ref(), "A", &json!({"id": "A", "name": "x", "updatedAt": 1}))
            .await
            .unwrap();

        let piped = collection_for::<Application>(Commander::Piped);
        db.update(piped.as_ref(), "A", &mut |v: &mut Value| {
            v["syncState"] = json!({"status": "OUT_OF_SYNC"});
            v["updatedAt"] = json!(5);
            Ok(())
        })
        .await
        .unwrap();

        let client: Value = serde_json::from_slice(&fs.get("datastore/Application/client/A.json").await.unwrap()).unwrap();
        assert!(client.get("syncState").is_none());
        let merged = db.get(web.as_ref(), "A").await.unwrap();
        assert_eq!(merged["syncState"]["status"], "OUT_OF_SYNC");
        assert_eq!(merged["updatedAt"], 5);
    }

    #[tokio::test]
    async fn test_update_unsupported_commander() {
        let (_, _, db) = setup();
        let col = collection_for::<Deployment>(Commander::Piped);
        db.create(col.as_ref(), "D", &json!({"id": "D"})).await.unwrap();

        let web = collection_for::<Deployment>(Commander::Web);
        let err = db
            .update(web.as_ref(), "D", &mut |_: &mut Value| Ok(()))
            .await
            .unwrap_err();
        assert!(err.is_unsupported());
    }

    #[tokio::test]
    async fn test_find_filters_orders_and_pages() {
        let (_, _, db) = setup();
        let col = collection_for::<Deployment>(Commander::Piped);
        for (id, status, created) in [
            ("d1", "DEPLOYMENT_PENDING", 1),
            ("d2", "DEPLOYMENT_RUNNING", 2),
            ("d3", "DEPLOYMENT_CANCELLED", 3),
            ("d4", "DEPLOYMENT_PENDING", 4),
        ] {
            db.create(col.as_ref(), id, &json!({"id": id, "status": status, "createdAt": created}))
                .await
                .unwrap();
        }

        let opts = ListOptions::default()
            .filter("Status", Operator::In, json!(["DEPLOYMENT_PENDING", "DEPLOYMENT_RUNNING"]))
            .order(Order::desc("CreatedAt"))
            .limit(2);
        let page = db.find(col.as_ref(), &opts).await.unwrap();
        let ids: Vec<&str> = page.entities.iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["d4", "d2"]);
        assert!(!page.cursor.is_empty());

        let next = ListOptions {
            cursor: page.cursor,
            ..opts
        };
        let page = db.find(col.as_ref(), &next).await.unwrap();
        let ids: Vec<&str> = page.entities.iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert_eq!(ids, ["d1"]);
        assert!(page.cursor.is_empty());
    }

    #[test]
    fn test_id_from_path() {
        let dir = "datastore/Command/client/";
        assert_eq!(id_from_path(dir, "datastore/Command/client/abc.json"), Some("abc"));
        assert_eq!(id_from_path(dir, "datastore/Command/client/x/abc.json"), None);
        assert_eq!(id_from_path(dir, "datastore/Command/client/abc.txt"), None);
    }
}
