//! PipeCD Platform - clients and manifests of deployment targets
//!
//! - [`processor`] renders encrypted secrets and file attachments into
//!   manifest files before they are parsed
//! - [`ecs`] talks to Amazon ECS, loads `servicedef.yaml`/`taskdef.yaml`,
//!   rolls out task sets and keeps the live state used for drift detection

pub mod ecs;
pub mod processor;
