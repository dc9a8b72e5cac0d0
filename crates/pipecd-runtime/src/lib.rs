//! PipeCD Runtime - process plumbing for the control-plane binaries
//!
//! A binary builds a root token bound to process signals, spawns every
//! component into a [`Group`], and exits with the group's first error.

pub mod admin;
pub mod group;
pub mod logging;
pub mod metrics;
pub mod serve;
pub mod signal;

pub use admin::AdminServer;
pub use group::Group;
pub use logging::{LogArgs, LogEncoding};
pub use signal::root_token;
pub use tokio_util::sync::CancellationToken;
