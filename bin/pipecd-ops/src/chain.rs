//! Deployment-chain controller
//!
//! Every tick walks the chains that are not completed yet and:
//! 1. copies the status of each in-flight node deployment into its block,
//! 2. attaches deployments the piped created for a started block but could
//!    not link itself,
//! 3. recomputes the chain status from its blocks,
//! 4. starts the next block once every earlier block succeeded, by sending
//!    one `ChainSyncApplication` command to the piped of each node.

use crate::schedule::Job;
use async_trait::async_trait;
use pipecd_common::Result;
use pipecd_common::model::{ChainNode, Command, CommandType, DeploymentChain, DeploymentStatus};
use pipecd_datastore::{ApplicationStore, CommandStore, Commander, DataStore, DeploymentChainStore, DeploymentStore};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CHAIN_SYNC_INTERVAL: Duration = Duration::from_secs(10);

struct NodeUpdate {
    block_index: usize,
    deployment_id: String,
    status: DeploymentStatus,
    reason: String,
}

pub struct ChainController {
    chains: DeploymentChainStore,
    deployments: DeploymentStore,
    applications: ApplicationStore,
    commands: CommandStore,
}

impl ChainController {
    pub fn new(ds: &Arc<dyn DataStore>) -> Self {
        Self {
            chains: DeploymentChainStore::new(ds.clone(), Commander::Ops),
            deployments: DeploymentStore::new(ds.clone(), Commander::Ops),
            applications: ApplicationStore::new(ds.clone(), Commander::Ops),
            commands: CommandStore::new(ds.clone(), Commander::Ops),
        }
    }

    /// Node deployments whose stored status moved since the last sync
    async fn changed_nodes(&self, chain: &DeploymentChain) -> Result<Vec<NodeUpdate>> {
        let mut out = Vec::new();
        for (block_index, block) in chain.blocks.iter().enumerate() {
            if block.is_completed() {
                continue;
            }
            for dref in block.nodes.iter().filter_map(|n| n.deployment_ref.as_ref()) {
                if dref.status.is_completed() {
                    continue;
                }
                let d = self.deployments.get(&dref.deployment_id).await?;
                if d.status != dref.status {
                    out.push(NodeUpdate {
                        block_index,
                        deployment_id: d.id,
                        status: d.status,
                        reason: d.status_reason,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Attach the triggered deployment of `node` when it belongs to this block
    async fn link_node(&self, chain_id: &str, block_index: usize, node: &ChainNode) -> Result<bool> {
        let app = self.applications.get(&node.application_ref.application_id).await?;
        let Some(triggered) = app.most_recently_triggered_deployment else {
            return Ok(false);
        };
        let d = self.deployments.get(&triggered.deployment_id).await?;
        if d.deployment_chain_id != chain_id || d.deployment_chain_block_index as usize != block_index {
            return Ok(false);
        }
        self.chains.add_deployment_to_block(chain_id, &d).await?;
        Ok(true)
    }

    async fn link_started_blocks(&self, chain: &DeploymentChain) -> Result<()> {
        for (block_index, block) in chain.blocks.iter().enumerate().skip(1) {
            if block.is_completed() || block.started_at == 0 {
                continue;
            }
            for node in block.nodes.iter().filter(|n| n.deployment_ref.is_none()) {
                if self.link_node(&chain.id, block_index, node).await? {
                    info!(
                        chain_id = %chain.id,
                        block_index,
                        application_id = %node.application_ref.application_id,
                        "linked deployment to chain block"
                    );
                }
            }
        }
        Ok(())
    }

    async fn start_block(&self, chain: &DeploymentChain, block_index: usize, now: i64) -> Result<()> {
        for node in &chain.blocks[block_index].nodes {
            let app = self.applications.get(&node.application_ref.application_id).await?;
            let cmd = Command {
                id: Uuid::new_v4().to_string(),
                piped_id: app.piped_id.clone(),
                application_id: app.id.clone(),
                project_id: app.project_id.clone(),
                commander: Commander::Ops.to_string(),
                kind: CommandType::ChainSyncApplication,
                payload: json!({
                    "deploymentChainId": chain.id,
                    "blockIndex": block_index,
                }),
                created_at: now,
                ..Default::default()
            };
            self.commands.add(cmd).await?;
        }
        self.chains
            .update(&chain.id, |c| {
                if let Some(b) = c.blocks.get_mut(block_index) {
                    b.started_at = now;
                }
                Ok(())
            })
            .await?;
        info!(chain_id = %chain.id, block_index, nodes = chain.blocks[block_index].nodes.len(), "started chain block");
        Ok(())
    }

    /// Advance one chain as far as its stored state allows
    pub async fn sync_chain(&self, chain: &DeploymentChain, now: i64) -> Result<()> {
        for u in self.changed_nodes(chain).await? {
            if let Err(e) = self
                .chains
                .update_node_deployment_status(&chain.id, u.block_index, &u.deployment_id, u.status, &u.reason)
                .await
            {
                // A sibling's terminal status may already have closed the block
                debug!(chain_id = %chain.id, deployment_id = %u.deployment_id, error = %e, "skipped node update");
            }
        }
        self.link_started_blocks(chain).await?;

        let chain = self.chains.update_chain_status(&chain.id).await?;
        if chain.is_completed() {
            info!(chain_id = %chain.id, status = ?chain.status, "deployment chain completed");
            return Ok(());
        }
        if let Some(next) = chain.next_startable_block()
            && chain.blocks[next].started_at == 0
        {
            self.start_block(&chain, next, now).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Job for ChainController {
    fn name(&self) -> &'static str {
        "deployment-chain-controller"
    }

    async fn run(&self, now: i64) -> Result<()> {
        let chains = self.chains.list_not_completed().await?;
        for chain in &chains {
            if let Err(e) = self.sync_chain(chain, now).await {
                warn!(chain_id = %chain.id, error = %e, "failed to sync deployment chain");
            }
        }
        debug!(chains = chains.len(), "synced deployment chains");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pipecd_common::model::{
        Application, ApplicationDeploymentReference, ChainApplicationRef, ChainBlock, ChainBlockStatus,
        ChainDeploymentRef, ChainStatus, CommandStatus, Deployment,
    };
    use pipecd_datastore::{ListOptions, Operator};

    const NOW: i64 = 1_700_000_000;

    fn node(app: &str, deployment: Option<&str>) -> ChainNode {
        ChainNode {
            application_ref: ChainApplicationRef {
                application_id: app.into(),
                application_name: app.into(),
            },
            deployment_ref: deployment.map(|id| ChainDeploymentRef {
                deployment_id: id.into(),
                status: DeploymentStatus::DeploymentPending,
                status_reason: String::new(),
            }),
        }
    }

    fn deployment(id: &str, app: &str, block_index: u32) -> Deployment {
        Deployment {
            id: id.into(),
            application_id: app.into(),
            piped_id: format!("piped-{app}"),
            project_id: "p".into(),
            deployment_chain_id: "chain".into(),
            deployment_chain_block_index: block_index,
            ..Default::default()
        }
    }

    struct Fixture {
        ctrl: ChainController,
        chains: DeploymentChainStore,
        deployments: DeploymentStore,
        applications: ApplicationStore,
        commands: CommandStore,
    }

    async fn fixture() -> Fixture {
        let ds = testing::datastore();
        let applications = ApplicationStore::new(ds.clone(), Commander::Piped);
        for app in ["a", "b"] {
            ApplicationStore::new(ds.clone(), Commander::Web)
                .add(Application {
                    id: app.into(),
                    name: app.into(),
                    piped_id: format!("piped-{app}"),
                    project_id: "p".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        let deployments = DeploymentStore::new(ds.clone(), Commander::Piped);
        deployments.add(deployment("d0", "a", 0)).await.unwrap();

        let chains = DeploymentChainStore::new(ds.clone(), Commander::Web);
        chains
            .add(DeploymentChain {
                id: "chain".into(),
                project_id: "p".into(),
                blocks: vec![
                    ChainBlock {
                        nodes: vec![node("a", Some("d0"))],
                        status: ChainBlockStatus::DeploymentBlockRunning,
                        started_at: NOW,
                        ..Default::default()
                    },
                    ChainBlock {
                        nodes: vec![node("b", None)],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        Fixture {
            ctrl: ChainController::new(&ds),
            chains,
            deployments,
            applications,
            commands: CommandStore::new(ds, Commander::Web),
        }
    }

    async fn chain_sync_commands(f: &Fixture) -> Vec<Command> {
        let opts = ListOptions::default().filter("PipedId", Operator::Equal, "piped-b");
        f.commands.list_all(&opts).await.unwrap()
    }

    #[tokio::test]
    async fn test_chain_advances_block_by_block() {
        let f = fixture().await;

        // Block 0 still running: nothing to start
        f.ctrl.run(NOW).await.unwrap();
        assert!(chain_sync_commands(&f).await.is_empty());
        assert_eq!(f.chains.get("chain").await.unwrap().status, ChainStatus::DeploymentChainRunning);

        f.deployments
            .update_status("d0", DeploymentStatus::DeploymentSuccess, "")
            .await
            .unwrap();
        f.ctrl.run(NOW).await.unwrap();

        let chain = f.chains.get("chain").await.unwrap();
        assert_eq!(chain.blocks[0].status, ChainBlockStatus::DeploymentBlockSuccess);
        assert_eq!(chain.blocks[1].started_at, NOW);
        let cmds = chain_sync_commands(&f).await;
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].kind, CommandType::ChainSyncApplication);
        assert_eq!(cmds[0].status, CommandStatus::CommandNotHandledYet);
        assert_eq!(cmds[0].payload["deploymentChainId"], "chain");
        assert_eq!(cmds[0].payload["blockIndex"], 1);

        // A started block is not started twice
        f.ctrl.run(NOW + 10).await.unwrap();
        assert_eq!(chain_sync_commands(&f).await.len(), 1);

        // The piped deploys b without linking it; the controller links it
        f.deployments.add(deployment("d1", "b", 1)).await.unwrap();
        f.applications
            .update_most_recent_deployment(
                "b",
                DeploymentStatus::DeploymentPending,
                ApplicationDeploymentReference {
                    deployment_id: "d1".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        f.ctrl.run(NOW + 20).await.unwrap();
        let chain = f.chains.get("chain").await.unwrap();
        assert_eq!(chain.blocks[1].status, ChainBlockStatus::DeploymentBlockRunning);
        assert_eq!(chain.blocks[1].nodes[0].deployment_ref.as_ref().unwrap().deployment_id, "d1");

        f.deployments
            .update_status("d1", DeploymentStatus::DeploymentSuccess, "")
            .await
            .unwrap();
        f.ctrl.run(NOW + 30).await.unwrap();
        let chain = f.chains.get("chain").await.unwrap();
        assert_eq!(chain.status, ChainStatus::DeploymentChainSuccess);
        assert!(chain.completed_at > 0);
        assert!(f.ctrl.chains.list_not_completed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_block_halts_chain() {
        let f = fixture().await;
        f.deployments
            .update_status("d0", DeploymentStatus::DeploymentFailure, "boom")
            .await
            .unwrap();
        f.ctrl.run(NOW).await.unwrap();

        let chain = f.chains.get("chain").await.unwrap();
        assert_eq!(chain.status, ChainStatus::DeploymentChainFailure);
        assert_eq!(chain.blocks[0].nodes[0].deployment_ref.as_ref().unwrap().status_reason, "boom");
        assert_eq!(chain.blocks[1].started_at, 0);
        assert!(chain_sync_commands(&f).await.is_empty());
    }
}
