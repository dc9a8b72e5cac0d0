//! Amazon ECS platform provider
//!
//! Services run with the `EXTERNAL` deployment controller so every rollout is
//! driven through task sets. Resources created here carry the managed-by tag
//! and nothing without it is ever mutated or garbage collected.

mod client;
mod livestate;
mod manifest;
mod registry;
mod taskset;
mod types;

pub use client::{EcsApi, EcsClient};
pub use livestate::{LiveManifests, LiveStateStore};
pub use manifest::{
    EcsApplicationConfig, EcsApplicationSpec, EcsDeploymentInput, Manifests, find_artifact_versions,
    load_manifests, parse_service_definition, parse_task_definition,
};
pub use registry::ClientRegistry;
pub use taskset::{
    LABEL_APPLICATION, LABEL_COMMIT_HASH, LABEL_MANAGED_BY, LABEL_PIPED, MANAGED_BY_PIPED, TaskSetStatus,
    apply_service_definition, clean_task_sets, create_canary_task_set, create_primary_task_set, is_managed,
    managed_tags,
};
pub use types::{
    ContainerDefinition, DeploymentController, Scale, Service, Tag, TaskDefinition, TaskSet,
};

use pipecd_common::sigv4::Credentials;
use pipecd_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Platform provider entry of the piped configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcsProviderConfig {
    pub region: String,
    /// Profile in the shared credentials file, `default` when empty
    pub profile: String,
    pub credentials_file: Option<PathBuf>,
    #[serde(rename = "roleARN")]
    pub role_arn: String,
    pub token_file: Option<PathBuf>,
    /// Override of `https://ecs.<region>.amazonaws.com`
    pub endpoint: Option<String>,
}

impl EcsProviderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            return Err(Error::configuration("ecs provider: region is required"));
        }
        if !self.role_arn.is_empty() || self.token_file.is_some() {
            return Err(Error::unsupported("ecs provider: assuming a role through web identity"));
        }
        Ok(())
    }

    pub fn credentials(&self) -> Result<Credentials> {
        match &self.credentials_file {
            Some(path) => {
                let profile = if self.profile.is_empty() { "default" } else { &self.profile };
                Credentials::from_shared_file(path, profile)
            }
            None => Credentials::from_env(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_provider_config() {
        let cfg: EcsProviderConfig = serde_yaml::from_str("region: ap-northeast-1\nroleARN: arn:aws:iam::1:role/x\n").unwrap();
        assert!(cfg.validate().unwrap_err().is_unsupported());

        let cfg = EcsProviderConfig::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_credentials_from_shared_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[default]\naws_access_key_id = AK1\naws_secret_access_key = S1\n\n[dev]\naws_access_key_id = AK2\naws_secret_access_key = S2"
        )
        .unwrap();
        let cfg = EcsProviderConfig {
            region: "us-east-1".into(),
            profile: "dev".into(),
            credentials_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        cfg.validate().unwrap();
        assert!(cfg.credentials().is_ok());
    }
}
