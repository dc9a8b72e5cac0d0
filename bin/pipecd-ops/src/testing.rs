//! In-memory datastore for job tests

use pipecd_cache::MemoryCache;
use pipecd_datastore::DataStore;
use pipecd_datastore::filedb::FileDb;
use pipecd_filestore::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

pub fn datastore() -> Arc<dyn DataStore> {
    Arc::new(FileDb::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new(Duration::ZERO)),
    ))
}
