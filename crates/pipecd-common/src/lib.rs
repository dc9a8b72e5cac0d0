//! PipeCD Common - Shared types and utilities
//!
//! Errors, the control-plane configuration, the persisted entity models and
//! the request signing helpers shared by every control-plane crate.

pub mod config;
pub mod duration;
pub mod error;
pub mod gcp;
pub mod model;
pub mod sigv4;

pub use config::{ControlPlaneConfig, DataStoreConfig};
pub use duration::Duration;
pub use error::{Error, ErrorKind, Result};
