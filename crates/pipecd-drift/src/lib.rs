//! PipeCD Drift - detects applications whose live state left Git
//!
//! A detector runs per platform provider. Every minute it pulls each
//! repository its applications live in, loads the head manifests (cached by
//! commit), diffs them against the live state and reports the sync state
//! whenever it changes.

pub mod ecs;
pub mod git;
mod manifest_cache;

pub use ecs::{ApplicationLister, EcsDetector, LiveStateGetter, RepositoryConfig, SyncStateReporter};
pub use git::{GitClient, GitOptions, GitRepo};
pub use manifest_cache::ManifestCache;
