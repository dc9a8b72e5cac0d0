//! PipeCD Datastore - entity persistence
//!
//! [`DataStore`] is implemented by three drivers:
//!
//! - [`filedb::FileDb`]: entities as sharded JSON blobs on the filestore,
//!   fronted by an etag-checked object cache
//! - [`mysql::MySql`]: one JSON row per entity
//! - [`firestore::Firestore`]: documents through the Firestore REST API
//!
//! Drivers move `serde_json::Value`s. The typed layer in [`stores`] binds a
//! [`Collection`] to a [`Commander`] and converts to and from the entity
//! models.

pub mod collection;
pub mod filedb;
pub mod filter;
pub mod firestore;
pub mod mysql;
pub mod stores;

use async_trait::async_trait;
use pipecd_cache::Cache;
use pipecd_common::config::DataStoreConfig;
use pipecd_common::{Error, Result};
use pipecd_filestore::Store;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

pub use collection::{Collection, collection_for};
pub use stores::*;

/// Identity a write is attributed to; selects the writable shard
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Commander {
    Piped,
    Web,
    Ops,
    Pipectl,
}

impl fmt::Display for Commander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Piped => "piped",
            Self::Web => "web",
            Self::Ops => "ops",
            Self::Pipectl => "pipectl",
        })
    }
}

/// Named partition of an entity's fields, stored as its own blob by FileDB
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Shard {
    /// Fields written from the web console and pipectl
    Client,
    /// Fields written by pipeds
    Agent,
}

impl Shard {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessThanOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterThanOrEqual,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not-in")]
    NotIn,
    #[serde(rename = "array-contains")]
    Contains,
}

/// `field operator value`; field names follow the model in PascalCase or camelCase
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: Direction::Desc,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ListOptions {
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    /// Zero means no limit
    pub limit: usize,
    /// Opaque position returned by a previous page
    pub cursor: String,
}

impl ListOptions {
    pub fn filter(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, operator, value));
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.orders.push(order);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Result of [`DataStore::find`]
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub entities: Vec<Value>,
    /// Pass back in [`ListOptions::cursor`] for the next page; empty when done
    pub cursor: String,
}

/// Mutation applied inside [`DataStore::update`]; may run more than once
pub type Updater<'a> = &'a mut (dyn FnMut(&mut Value) -> Result<()> + Send);

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn find(&self, col: &dyn Collection, opts: &ListOptions) -> Result<Page>;

    async fn get(&self, col: &dyn Collection, id: &str) -> Result<Value>;

    /// Fails with `AlreadyExists` when the id is taken
    async fn create(&self, col: &dyn Collection, id: &str, entity: &Value) -> Result<()>;

    async fn update(&self, col: &dyn Collection, id: &str, updater: Updater<'_>) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the driver selected by the configuration
///
/// FileDB persists through `fs` and caches blobs in `cache`; the other drivers
/// ignore both.
pub async fn open(cfg: &DataStoreConfig, fs: Arc<dyn Store>, cache: Arc<dyn Cache>) -> Result<Arc<dyn DataStore>> {
    match cfg {
        DataStoreConfig::FileDb(_) => Ok(Arc::new(filedb::FileDb::new(fs, cache))),
        DataStoreConfig::MySql(c) => Ok(Arc::new(mysql::MySql::connect(c)?)),
        DataStoreConfig::Firestore(c) => Ok(Arc::new(firestore::Firestore::from_config(c)?)),
    }
}

pub(crate) fn decode_error(kind: &str, id: &str, e: &serde_json::Error) -> Error {
    Error::internal(format!("failed to decode {kind} {id}: {e}"))
}
