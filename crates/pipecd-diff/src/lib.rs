//! PipeCD Diff - structured comparison of manifest trees
//!
//! [`diff`] walks two JSON trees (YAML manifests deserialize into the same
//! shape) and reports every leaf that differs as a [`DiffNode`]. The result
//! renders either as a path-annotated YAML-like listing through
//! [`Renderer`] or as a unified diff from the host `diff` command through
//! [`render_by_command`].

mod command;
mod differ;
mod renderer;
mod result;

pub use command::render_by_command;
pub use differ::{DiffOptions, diff};
pub use renderer::Renderer;
pub use result::{DiffNode, DiffResult, PathStep, ValueType};
