use super::{impl_entity, require};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationKind {
    #[default]
    Kubernetes,
    Terraform,
    Lambda,
    Cloudrun,
    Ecs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApplicationSyncStatus {
    #[default]
    Unknown,
    Synced,
    Deploying,
    OutOfSync,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationGitRepository {
    pub id: String,
    pub remote: String,
    pub branch: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationGitPath {
    pub repo: ApplicationGitRepository,
    /// Directory of the application inside the repository
    pub path: String,
    pub config_filename: String,
    pub url: String,
}

impl ApplicationGitPath {
    pub fn config_filename_or_default(&self) -> &str {
        if self.config_filename.is_empty() {
            "app.pipecd.yaml"
        } else {
            &self.config_filename
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationSyncState {
    pub status: ApplicationSyncStatus,
    pub short_reason: String,
    pub reason: String,
    pub head_deployment_id: String,
    pub timestamp: i64,
}

impl ApplicationSyncState {
    pub fn synced(short_reason: impl Into<String>, timestamp: i64) -> Self {
        Self {
            status: ApplicationSyncStatus::Synced,
            short_reason: short_reason.into(),
            timestamp,
            ..Self::default()
        }
    }

    pub fn out_of_sync(short_reason: impl Into<String>, reason: impl Into<String>, timestamp: i64) -> Self {
        Self {
            status: ApplicationSyncStatus::OutOfSync,
            short_reason: short_reason.into(),
            reason: reason.into(),
            timestamp,
            ..Self::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactVersionKind {
    #[default]
    Unknown,
    ContainerImage,
    S3Object,
    GitSource,
    TerraformModule,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ArtifactVersion {
    pub kind: ArtifactVersionKind,
    pub version: String,
    pub name: String,
    pub url: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApplicationDeploymentReference {
    pub deployment_id: String,
    pub summary: String,
    pub version: String,
    pub config_filename: String,
    pub versions: Vec<ArtifactVersion>,
    pub started_at: i64,
    pub completed_at: i64,
}

/// A deployable unit managed by a piped
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Application {
    pub id: String,
    pub name: String,
    pub piped_id: String,
    pub project_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    /// Name of the platform provider registered in the piped
    pub platform_provider: String,
    pub description: String,
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_recently_successful_deployment: Option<ApplicationDeploymentReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub most_recently_triggered_deployment: Option<ApplicationDeploymentReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<ApplicationSyncState>,
    pub deploying: bool,
    pub deleted_at: i64,
    pub deleted: bool,
    pub disabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Application {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.name, "name")?;
        require(&self.piped_id, "pipedId")?;
        require(&self.project_id, "projectId")
    }

    /// Whether the application is owned by the given project
    pub fn belongs_to(&self, project_id: &str) -> bool {
        self.project_id == project_id
    }
}

impl_entity!(Application, "Application");
