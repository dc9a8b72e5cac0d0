//! ECS application configuration and manifests

use super::types::{Service, TaskDefinition};
use crate::processor::{Attachment, ManifestProcessor, SecretDecrypter, SecretEncryption};
use pipecd_common::model::{ArtifactVersion, ArtifactVersionKind};
use pipecd_common::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;

pub const APPLICATION_KIND: &str = "ECSApp";
pub const DEFAULT_SERVICE_DEFINITION_FILE: &str = "servicedef.yaml";
pub const DEFAULT_TASK_DEFINITION_FILE: &str = "taskdef.yaml";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcsDeploymentInput {
    pub service_definition_file: String,
    pub task_definition_file: String,
    pub launch_type: String,
    /// `ELB` or `SERVICE_DISCOVERY`
    pub access_type: String,
}

impl Default for EcsDeploymentInput {
    fn default() -> Self {
        Self {
            service_definition_file: DEFAULT_SERVICE_DEFINITION_FILE.to_string(),
            task_definition_file: DEFAULT_TASK_DEFINITION_FILE.to_string(),
            launch_type: "FARGATE".to_string(),
            access_type: "ELB".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EcsApplicationSpec {
    pub name: String,
    pub input: EcsDeploymentInput,
    pub encryption: Option<SecretEncryption>,
    pub attachment: Option<Attachment>,
}

/// The application configuration file, `app.pipecd.yaml` by default
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EcsApplicationConfig {
    #[serde(default)]
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub spec: EcsApplicationSpec,
}

impl EcsApplicationConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::not_found(format!("application config {}", path.display())),
            _ => Error::from(e),
        })?;
        let cfg: Self = serde_yaml::from_str(&data)
            .map_err(|e| Error::invalid_argument(format!("invalid application config {}: {e}", path.display())))?;
        if cfg.kind != APPLICATION_KIND {
            return Err(Error::invalid_argument(format!(
                "application config {} has kind {:?}, want {APPLICATION_KIND}",
                path.display(),
                cfg.kind
            )));
        }
        Ok(cfg)
    }

    /// A processor for `app_dir` with this application's secrets and attachments
    pub fn processor(&self, app_dir: &Path, decrypter: Option<&dyn SecretDecrypter>) -> Result<ManifestProcessor> {
        let mut processor = ManifestProcessor::new(app_dir);
        if let Some(encryption) = &self.spec.encryption {
            let decrypter = decrypter.ok_or_else(|| {
                Error::configuration("application uses sealed secrets but no secret decrypter is configured")
            })?;
            processor = processor.with_secrets(encryption, decrypter)?;
        }
        if let Some(attachment) = &self.spec.attachment {
            processor = processor.with_attachments(attachment)?;
        }
        Ok(processor)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifests {
    pub service_definition: Service,
    pub task_definition: TaskDefinition,
}

impl Manifests {
    /// Both definitions as one document, the shape drift is computed over
    pub fn to_tree(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn parse<T: serde::de::DeserializeOwned>(data: &str, what: &str) -> Result<T> {
    // YAML is a superset of the JSON these files are often written in
    serde_yaml::from_str(data).map_err(|e| Error::invalid_argument(format!("invalid {what}: {e}")))
}

pub fn parse_service_definition(data: &str) -> Result<Service> {
    let service: Service = parse(data, "service definition")?;
    if service.service_name.is_empty() {
        return Err(Error::invalid_argument("service definition: serviceName is required"));
    }
    Ok(service)
}

pub fn parse_task_definition(data: &str) -> Result<TaskDefinition> {
    parse(data, "task definition")
}

/// Load and render both definitions named by `input`
pub fn load_manifests(processor: &ManifestProcessor, input: &EcsDeploymentInput) -> Result<Manifests> {
    let service_file = non_empty(&input.service_definition_file, DEFAULT_SERVICE_DEFINITION_FILE);
    let task_file = non_empty(&input.task_definition_file, DEFAULT_TASK_DEFINITION_FILE);
    Ok(Manifests {
        service_definition: parse_service_definition(&processor.read(service_file)?)?,
        task_definition: parse_task_definition(&processor.read(task_file)?)?,
    })
}

fn non_empty<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

/// Split `registry/path/name:tag` into name and tag
fn parse_container_image(image: &str) -> (&str, &str) {
    let (path, tag) = match image.rsplit_once(':') {
        // A colon before the last slash is a registry port, not a tag
        Some((path, tag)) if !tag.contains('/') => (path, tag),
        _ => (image, ""),
    };
    (path.rsplit('/').next().unwrap_or(path), tag)
}

/// Container images referenced by `task_definition`, one per distinct image
pub fn find_artifact_versions(task_definition: &TaskDefinition) -> Result<Vec<ArtifactVersion>> {
    if task_definition.container_definitions.is_empty() {
        return Err(Error::invalid_argument("container definition could not be found"));
    }
    let mut seen = BTreeSet::new();
    let mut versions = Vec::new();
    for container in &task_definition.container_definitions {
        if !seen.insert(container.image.as_str()) {
            continue;
        }
        let (name, tag) = parse_container_image(&container.image);
        if name.is_empty() {
            return Err(Error::invalid_argument(format!(
                "image name could not be empty in container {}",
                container.name
            )));
        }
        versions.push(ArtifactVersion {
            kind: ArtifactVersionKind::ContainerImage,
            version: tag.to_string(),
            name: name.to_string(),
            url: container.image.clone(),
        });
    }
    Ok(versions)
}
