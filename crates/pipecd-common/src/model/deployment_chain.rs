use super::{Deployment, DeploymentStatus, impl_entity, require};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainStatus {
    #[default]
    DeploymentChainPending,
    DeploymentChainRunning,
    DeploymentChainSuccess,
    DeploymentChainFailure,
    DeploymentChainCancelled,
}

impl ChainStatus {
    pub const fn is_completed(self) -> bool {
        matches!(
            self,
            Self::DeploymentChainSuccess | Self::DeploymentChainFailure | Self::DeploymentChainCancelled
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainBlockStatus {
    #[default]
    DeploymentBlockPending,
    DeploymentBlockRunning,
    DeploymentBlockSuccess,
    DeploymentBlockFailure,
    DeploymentBlockCancelled,
}

impl ChainBlockStatus {
    pub const fn is_completed(self) -> bool {
        matches!(
            self,
            Self::DeploymentBlockSuccess | Self::DeploymentBlockFailure | Self::DeploymentBlockCancelled
        )
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainApplicationRef {
    pub application_id: String,
    pub application_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainDeploymentRef {
    pub deployment_id: String,
    pub status: DeploymentStatus,
    pub status_reason: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainNode {
    pub application_ref: ChainApplicationRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_ref: Option<ChainDeploymentRef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChainBlock {
    pub nodes: Vec<ChainNode>,
    pub status: ChainBlockStatus,
    pub started_at: i64,
    pub completed_at: i64,
}

impl ChainBlock {
    pub const fn is_completed(&self) -> bool {
        self.status.is_completed()
    }
}

/// Ordered blocks of deployments, each block gated by the previous one
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentChain {
    pub id: String,
    pub project_id: String,
    pub status: ChainStatus,
    pub blocks: Vec<ChainBlock>,
    pub completed_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeploymentChain {
    fn validate_fields(&self) -> Result<()> {
        require(&self.id, "id")?;
        require(&self.project_id, "projectId")?;
        if self.blocks.is_empty() {
            return Err(Error::invalid_argument("deployment chain must contain at least one block"));
        }
        Ok(())
    }

    pub const fn is_completed(&self) -> bool {
        self.status.is_completed()
    }

    /// Attach a freshly created deployment to the node of its application
    pub fn add_deployment_to_block(&mut self, deployment: &Deployment) -> Result<()> {
        let index = deployment.deployment_chain_block_index as usize;
        if index == 0 || index >= self.blocks.len() {
            return Err(Error::invalid_argument(format!("invalid block index ({index}) provided")));
        }
        let block = &mut self.blocks[index];
        if block.is_completed() {
            return Err(Error::invalid_argument("can not update a finished block"));
        }
        let node = block
            .nodes
            .iter_mut()
            .find(|n| n.application_ref.application_id == deployment.application_id)
            .ok_or_else(|| {
                Error::invalid_argument("unable to find the right node in chain to assign deployment to")
            })?;
        node.deployment_ref = Some(ChainDeploymentRef {
            deployment_id: deployment.id.clone(),
            status: deployment.status,
            status_reason: deployment.status_reason.clone(),
        });
        block.status = ChainBlockStatus::DeploymentBlockRunning;
        Ok(())
    }

    /// Record a node's deployment status and recompute the block status
    pub fn update_node_deployment_status(
        &mut self,
        block_index: usize,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
        now: i64,
    ) -> Result<()> {
        let block = self
            .blocks
            .get_mut(block_index)
            .ok_or_else(|| Error::invalid_argument(format!("invalid block index {block_index} provided")))?;
        if block.is_completed() {
            return Err(Error::invalid_argument("can not update a finished block"));
        }

        let mut updated = false;
        let (mut success, mut failure, mut cancelled) = (0usize, 0usize, 0usize);
        for node in &mut block.nodes {
            let Some(dref) = node.deployment_ref.as_mut() else {
                continue;
            };
            if dref.deployment_id == deployment_id {
                dref.status = status;
                dref.status_reason = reason.to_string();
                updated = true;
            }
            match dref.status {
                DeploymentStatus::DeploymentSuccess => success += 1,
                DeploymentStatus::DeploymentFailure => failure += 1,
                DeploymentStatus::DeploymentCancelled => cancelled += 1,
                _ => {}
            }
        }
        if !updated {
            return Err(Error::invalid_argument(
                "unable to find the right node in chain to assign deployment to",
            ));
        }

        let next = if success == block.nodes.len() {
            Some(ChainBlockStatus::DeploymentBlockSuccess)
        } else if failure > 0 {
            Some(ChainBlockStatus::DeploymentBlockFailure)
        } else if cancelled > 0 {
            Some(ChainBlockStatus::DeploymentBlockCancelled)
        } else {
            None
        };
        if let Some(s) = next {
            block.status = s;
            block.completed_at = now;
        }
        Ok(())
    }

    /// Chain status derived from its blocks
    ///
    /// A failed or cancelled block halts the chain. The chain succeeds once
    /// every block succeeded.
    pub fn computed_status(&self) -> ChainStatus {
        let mut all_success = true;
        let mut any_started = false;
        for block in &self.blocks {
            match block.status {
                ChainBlockStatus::DeploymentBlockFailure => return ChainStatus::DeploymentChainFailure,
                ChainBlockStatus::DeploymentBlockCancelled => return ChainStatus::DeploymentChainCancelled,
                ChainBlockStatus::DeploymentBlockSuccess => any_started = true,
                ChainBlockStatus::DeploymentBlockRunning => {
                    any_started = true;
                    all_success = false;
                }
                ChainBlockStatus::DeploymentBlockPending => all_success = false,
            }
        }
        if all_success {
            ChainStatus::DeploymentChainSuccess
        } else if any_started {
            ChainStatus::DeploymentChainRunning
        } else {
            ChainStatus::DeploymentChainPending
        }
    }

    /// Index of the first block that has not started while every earlier block succeeded
    pub fn next_startable_block(&self) -> Option<usize> {
        for (i, block) in self.blocks.iter().enumerate() {
            match block.status {
                ChainBlockStatus::DeploymentBlockSuccess => {}
                ChainBlockStatus::DeploymentBlockPending => return Some(i),
                _ => return None,
            }
        }
        None
    }
}

impl_entity!(DeploymentChain, "DeploymentChain");
