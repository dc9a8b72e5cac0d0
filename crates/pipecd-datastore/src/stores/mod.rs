//! Typed entity stores
//!
//! [`EntityStore`] binds an entity model to its collection and to the
//! commander performing the writes. Entity-specific transitions are inherent
//! methods on the concrete `EntityStore<E>` in the sibling modules.

mod apikey;
mod application;
mod command;
mod deployment;
mod deployment_chain;
mod event;
mod piped;
mod project;

pub use piped::PipedMetadata;

use crate::{Collection, Commander, DataStore, ListOptions, collection_for, decode_error};
use pipecd_common::model::{
    ApiKey, Application, Command, Deployment, DeploymentChain, Entity, Event, Piped, Project, now_unix,
};
use pipecd_common::{Error, Result};
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;

pub type ApplicationStore = EntityStore<Application>;
pub type DeploymentStore = EntityStore<Deployment>;
pub type CommandStore = EntityStore<Command>;
pub type PipedStore = EntityStore<Piped>;
pub type ApiKeyStore = EntityStore<ApiKey>;
pub type EventStore = EntityStore<Event>;
pub type DeploymentChainStore = EntityStore<DeploymentChain>;
pub type ProjectStore = EntityStore<Project>;

pub struct EntityStore<E: Entity> {
    ds: Arc<dyn DataStore>,
    col: Box<dyn Collection>,
    commander: Commander,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityStore<E> {
    pub fn new(ds: Arc<dyn DataStore>, commander: Commander) -> Self {
        Self {
            ds,
            col: collection_for::<E>(commander),
            commander,
            _entity: PhantomData,
        }
    }

    pub const fn commander(&self) -> Commander {
        self.commander
    }

    /// Stamp, validate and create `entity`
    pub async fn add(&self, mut entity: E) -> Result<E> {
        entity.stamp(now_unix());
        entity.validate()?;
        let value = serde_json::to_value(&entity)?;
        self.ds.create(self.col.as_ref(), entity.id(), &value).await?;
        Ok(entity)
    }

    pub async fn get(&self, id: &str) -> Result<E> {
        let value = self.ds.get(self.col.as_ref(), id).await?;
        serde_json::from_value(value).map_err(|e| decode_error(E::KIND, id, &e))
    }

    /// One page of entities and the cursor of the next one
    pub async fn list(&self, opts: &ListOptions) -> Result<(Vec<E>, String)> {
        let page = self.ds.find(self.col.as_ref(), opts).await?;
        let entities = page
            .entities
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(|e| decode_error(E::KIND, "", &e)))
            .collect::<Result<Vec<E>>>()?;
        Ok((entities, page.cursor))
    }

    /// Every entity matching `opts`, following cursors to the end
    pub async fn list_all(&self, opts: &ListOptions) -> Result<Vec<E>> {
        let mut opts = opts.clone();
        let mut out = Vec::new();
        loop {
            let (mut page, cursor) = self.list(&opts).await?;
            out.append(&mut page);
            if cursor.is_empty() || opts.limit == 0 {
                return Ok(out);
            }
            opts.cursor = cursor;
        }
    }

    /// Apply `f` to the stored entity and write it back
    ///
    /// `updatedAt` moves to the current time, never backwards, and the result
    /// is validated before the write.
    pub async fn update<F>(&self, id: &str, mut f: F) -> Result<E>
    where
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        let mut updated: Option<E> = None;
        let mut updater = |value: &mut Value| -> Result<()> {
            let mut entity: E =
                serde_json::from_value(value.clone()).map_err(|e| decode_error(E::KIND, id, &e))?;
            f(&mut entity)?;
            entity.set_updated_at(now_unix().max(entity.updated_at()));
            entity.validate()?;
            *value = serde_json::to_value(&entity)?;
            updated = Some(entity);
            Ok(())
        };
        self.ds.update(self.col.as_ref(), id, &mut updater).await?;
        updated.ok_or_else(|| Error::internal(format!("update of {} {id} did not run", E::KIND)))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::filedb::FileDb;
    use crate::DataStore;
    use pipecd_cache::MemoryCache;
    use pipecd_filestore::memory::MemoryStore;
    use std::sync::Arc;

    pub fn filedb() -> Arc<dyn DataStore> {
        Arc::new(FileDb::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::new(std::time::Duration::ZERO)),
        ))
    }
}
