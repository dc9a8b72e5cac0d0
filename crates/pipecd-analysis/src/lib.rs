//! PipeCD Analysis - the ANALYSIS pipeline stage
//!
//! An [`Executor`] runs every configured probe concurrently until the stage
//! duration runs out. Metric probes query a [`provider::MetricsProvider`]
//! and judge the points with one of the [`config::AnalysisStrategy`]
//! strategies; log probes ask a [`provider::LogProvider`]; HTTP probes
//! check a response status. A probe that fails more often than its failure
//! limit fails the stage.

pub mod analyzer;
pub mod config;
pub mod executor;
pub mod mannwhitney;
pub mod provider;
pub mod template;

pub use config::{AnalysisStageOptions, AnalysisTemplateSpec};
pub use executor::{
    AnalysisOutcome, ApplicationResults, DeploymentStageMetadata, Executor, SkipCommands, StageInput,
};
pub use provider::ProviderRegistry;
