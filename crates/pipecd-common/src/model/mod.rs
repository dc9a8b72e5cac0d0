//! Persistent entities of the control plane
//!
//! Entities serialize to camelCase JSON. The same JSON is stored by every
//! datastore driver and is what list filters are evaluated against.

mod analysis;
mod apikey;
mod application;
mod command;
mod deployment;
mod deployment_chain;
mod event;
mod insight;
mod piped;
mod project;

pub use analysis::*;
pub use apikey::*;
pub use application::*;
pub use command::*;
pub use deployment::*;
pub use deployment_chain::*;
pub use event::*;
pub use insight::*;
pub use piped::*;
pub use project::*;

use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

/// A record persisted through the datastore
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Collection kind, e.g. `Application`
    const KIND: &'static str;

    fn id(&self) -> &str;

    /// Unix seconds of the last write
    fn updated_at(&self) -> i64;

    fn set_updated_at(&mut self, ts: i64);

    fn created_at(&self) -> i64;

    fn set_created_at(&mut self, ts: i64);

    /// Field-level checks run before every write
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Fill `created_at`/`updated_at` when unset
    fn stamp(&mut self, now: i64) {
        if self.created_at() == 0 {
            self.set_created_at(now);
        }
        if self.updated_at() == 0 {
            self.set_updated_at(now);
        }
    }
}

macro_rules! impl_entity {
    ($ty:ty, $kind:literal) => {
        impl $crate::model::Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn updated_at(&self) -> i64 {
                self.updated_at
            }

            fn set_updated_at(&mut self, ts: i64) {
                self.updated_at = ts;
            }

            fn created_at(&self) -> i64 {
                self.created_at
            }

            fn set_created_at(&mut self, ts: i64) {
                self.created_at = ts;
            }

            fn validate(&self) -> $crate::error::Result<()> {
                <$ty>::validate_fields(self)
            }
        }
    };
}
pub(crate) use impl_entity;

pub(crate) fn require(value: &str, field: &str) -> Result<()> {
    if value.is_empty() {
        return Err(crate::Error::invalid_argument(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Hex encoded SHA-256 of the given parts joined with `/`
pub fn hash_id(parts: &[&str]) -> String {
    let mut h = Sha256::new();
    h.update(parts.join("/").as_bytes());
    hex::encode(h.finalize())
}

/// Current unix time in seconds
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
