use super::{ApplicationGitPath, ApplicationKind, ArtifactVersion, impl_entity, require};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    #[default]
    DeploymentPending,
    DeploymentPlanned,
    DeploymentRunning,
    DeploymentRollingBack,
    DeploymentSuccess,
    DeploymentFailure,
    DeploymentCancelled,
}

impl DeploymentStatus {
    /// Statuses that still have work left
    pub const NOT_COMPLETED: [Self; 4] = [
        Self::DeploymentPending,
        Self::DeploymentPlanned,
        Self::DeploymentRunning,
        Self::DeploymentRollingBack,
    ];

    pub const fn is_completed(self) -> bool {
        matches!(
            self,
            Self::DeploymentSuccess | Self::DeploymentFailure | Self::DeploymentCancelled
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DeploymentPending => "DEPLOYMENT_PENDING",
            Self::DeploymentPlanned => "DEPLOYMENT_PLANNED",
            Self::DeploymentRunning => "DEPLOYMENT_RUNNING",
            Self::DeploymentRollingBack => "DEPLOYMENT_ROLLING_BACK",
            Self::DeploymentSuccess => "DEPLOYMENT_SUCCESS",
            Self::DeploymentFailure => "DEPLOYMENT_FAILURE",
            Self::DeploymentCancelled => "DEPLOYMENT_CANCELLED",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageStatus {
    #[default]
    StageNotStartedYet,
    StageRunning,
    StageSuccess,
    StageFailure,
    StageCancelled,
    StageSkipped,
    StageExited,
}

impl StageStatus {
    pub const fn is_completed(self) -> bool {
        !matches!(self, Self::StageNotStartedYet | Self::StageRunning)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Commit {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub branch: String,
    pub url: String,
    pub created_at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentTrigger {
    pub commit: Commit,
    pub commander: String,
    pub timestamp: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineStage {
    pub id: String,
    pub name: String,
    pub desc: String,
    pub index: i32,
    pub predefined: bool,
    pub requires: Vec<String>,
    pub visible: bool,
    pub status: StageStatus,
    pub status_reason: String,
    pub metadata: BTreeMap<String, String>,
    pub retried_count: i32,
    pub completed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One execution of an application's pipeline
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Deployment {
    pub id: String,
    pub application_id: String,
    pub application_name: String,
    pub piped_id: String,
    pub project_id: String,
    pub kind: ApplicationKind,
    pub git_path: ApplicationGitPath,
    pub platform_provider: String,
    pub labels: BTreeMap<String, String>,
    pub trigger: DeploymentTrigger,
    pub summary: String,
    pub version: String,
    pub versions: Vec<ArtifactVersion>,
    pub running_commit_hash: String,
    pub running_config_filename: String,
    pub status: DeploymentStatus,
    pub status_reason: String,
    pub stages: Vec<PipelineStage>,
    pub metadata: BTreeMap<String, String>,
    /// Chain this deployment belongs to, empty when not chained
    pub deployment_chain_id: String,
    pub deployment_chain_block_index: u32,
    pub completed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Deployment {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.application_id, "applicationId")?;
        require(&self.piped_id, "pipedId")?;
        require(&self.project_id, "projectId")
    }

    pub fn is_in_chain(&self) -> bool {
        !self.deployment_chain_id.is_empty()
    }

    pub fn stage(&self, stage_id: &str) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Move the deployment into a terminal status, updating matching stages
    pub fn complete(
        &mut self,
        status: DeploymentStatus,
        stage_statuses: &BTreeMap<String, StageStatus>,
        reason: impl Into<String>,
        completed_at: i64,
    ) -> Result<()> {
        if !status.is_completed() {
            return Err(Error::invalid_argument(format!(
                "deployment status {} is not a completed value",
                status.as_str()
            )));
        }
        self.status = status;
        self.status_reason = reason.into();
        self.completed_at = completed_at;
        for stage in &mut self.stages {
            if let Some(s) = stage_statuses.get(&stage.id) {
                stage.status = *s;
            }
        }
        Ok(())
    }

    /// Update one stage, failing when the stage id is unknown
    pub fn update_stage(
        &mut self,
        stage_id: &str,
        status: StageStatus,
        reason: impl Into<String>,
        retried_count: i32,
        completed_at: i64,
    ) -> Result<()> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.id == stage_id)
            .ok_or_else(|| Error::invalid_argument(format!("stage id {stage_id} not found")))?;
        stage.status = status;
        stage.status_reason = reason.into();
        stage.retried_count = retried_count;
        stage.completed_at = completed_at;
        Ok(())
    }

    /// Merge metadata into a stage; new keys win
    pub fn merge_stage_metadata(&mut self, stage_id: &str, metadata: &BTreeMap<String, String>) -> Result<()> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.id == stage_id)
            .ok_or_else(|| Error::invalid_argument(format!("stage id {stage_id} not found")))?;
        merge_metadata(&mut stage.metadata, metadata);
        Ok(())
    }
}

pub fn merge_metadata(dst: &mut BTreeMap<String, String>, src: &BTreeMap<String, String>) {
    for (k, v) in src {
        dst.insert(k.clone(), v.clone());
    }
}

impl_entity!(Deployment, "Deployment");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_status_json() {
        let s = serde_json::to_string(&DeploymentStatus::DeploymentRollingBack).unwrap();
        assert_eq!(s, "\"DEPLOYMENT_ROLLING_BACK\"");
        for st in DeploymentStatus::NOT_COMPLETED {
            assert!(!st.is_completed());
            assert_eq!(serde_json::to_value(st).unwrap(), st.as_str());
        }
    }

    #[test]
    fn test_complete_rejects_running() {
        let mut d = Deployment::default();
        let err = d
            .complete(DeploymentStatus::DeploymentRunning, &BTreeMap::new(), "", 1)
            .unwrap_err();
        assert!(err.to_string().contains("not a completed value"));
    }

    #[test]
    fn test_complete_updates_stages() {
        let mut d = Deployment {
            stages: vec![
                PipelineStage { id: "s1".into(), ..Default::default() },
                PipelineStage { id: "s2".into(), ..Default::default() },
            ],
            ..Default::default()
        };
        let statuses = BTreeMap::from([("s2".to_string(), StageStatus::StageFailure)]);
        d.complete(DeploymentStatus::DeploymentFailure, &statuses, "boom", 42).unwrap();
        assert_eq!(d.completed_at, 42);
        assert_eq!(d.stages[0].status, StageStatus::StageNotStartedYet);
        assert_eq!(d.stages[1].status, StageStatus::StageFailure);
    }
}
