//! Debounced API-key last-used timestamps
//!
//! Request authentication records `key id -> unix seconds` in
//! `HASHKEY:PIPED:API_KEYS` as ASCII decimal; the ops updater drains the
//! hash into the datastore.

use pipecd_cache::HashCache;
use pipecd_common::Result;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const API_KEYS_KEY: &str = "HASHKEY:PIPED:API_KEYS";

pub struct ApiKeyLastUsedStore {
    hash: Arc<dyn HashCache>,
}

/// Decimal seconds, with anything unparseable read as 0
pub fn parse_last_used(raw: &[u8]) -> i64 {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

impl ApiKeyLastUsedStore {
    pub fn new(hash: Arc<dyn HashCache>) -> Self {
        Self { hash }
    }

    pub async fn put(&self, key_id: &str, used_at: i64) -> Result<()> {
        self.hash.put(key_id, used_at.to_string().as_bytes()).await
    }

    /// Every recorded key; an empty hash yields an empty map
    pub async fn get_all(&self) -> Result<BTreeMap<String, i64>> {
        match self.hash.get_all().await {
            Ok(all) => Ok(all
                .into_iter()
                .map(|(id, raw)| {
                    let ts = parse_last_used(&raw);
                    (id, ts)
                })
                .collect()),
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }
}
