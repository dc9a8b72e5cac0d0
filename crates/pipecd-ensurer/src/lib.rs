//! PipeCD Ensurer - idempotent datastore bootstrap
//!
//! - [`sql::SqlEnsurer`] applies the embedded MySQL schema and indexes
//! - [`firestore::IndexEnsurer`] creates missing Firestore composite indexes
//!   through `gcloud`
//!
//! Both can run on every startup.

pub mod firestore;
pub mod sql;

pub use firestore::{Gcloud, IndexEnsurer};
pub use sql::SqlEnsurer;
