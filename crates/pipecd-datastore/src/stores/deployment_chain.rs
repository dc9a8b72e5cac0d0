use super::EntityStore;
use crate::{ListOptions, Operator};
use pipecd_common::model::{Deployment, DeploymentChain, DeploymentStatus, now_unix};
use pipecd_common::Result;
use serde_json::Value;

impl EntityStore<DeploymentChain> {
    pub async fn add_deployment_to_block(&self, chain_id: &str, deployment: &Deployment) -> Result<DeploymentChain> {
        self.update(chain_id, |c| c.add_deployment_to_block(deployment)).await
    }

    /// Record a node's deployment status, then refresh the chain status
    pub async fn update_node_deployment_status(
        &self,
        chain_id: &str,
        block_index: usize,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<DeploymentChain> {
        let now = now_unix();
        self.update(chain_id, |c| {
            c.update_node_deployment_status(block_index, deployment_id, status, reason, now)?;
            refresh_status(c, now);
            Ok(())
        })
        .await
    }

    /// Recompute the chain status from its blocks
    pub async fn update_chain_status(&self, chain_id: &str) -> Result<DeploymentChain> {
        let now = now_unix();
        self.update(chain_id, |c| {
            refresh_status(c, now);
            Ok(())
        })
        .await
    }

    pub async fn list_not_completed(&self) -> Result<Vec<DeploymentChain>> {
        let statuses = vec![
            Value::from("DEPLOYMENT_CHAIN_PENDING"),
            Value::from("DEPLOYMENT_CHAIN_RUNNING"),
        ];
        let opts = ListOptions::default().filter("Status", Operator::In, statuses);
        self.list_all(&opts).await
    }
}

fn refresh_status(chain: &mut DeploymentChain, now: i64) {
    let status = chain.computed_status();
    if status != chain.status {
        chain.status = status;
        if status.is_completed() {
            chain.completed_at = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::stores::testing::filedb;
    use crate::{Commander, DeploymentChainStore};
    use pipecd_common::model::{
        ChainApplicationRef, ChainBlock, ChainBlockStatus, ChainNode, ChainStatus, Deployment, DeploymentChain,
        DeploymentStatus,
    };

    fn chain() -> DeploymentChain {
        let node = |app: &str| ChainNode {
            application_ref: ChainApplicationRef {
                application_id: app.into(),
                application_name: app.into(),
            },
            deployment_ref: None,
        };
        DeploymentChain {
            id: "chain".into(),
            project_id: "p".into(),
            status: ChainStatus::DeploymentChainRunning,
            blocks: vec![
                ChainBlock {
                    nodes: vec![node("a")],
                    status: ChainBlockStatus::DeploymentBlockSuccess,
                    ..Default::default()
                },
                ChainBlock { nodes: vec![node("b")], ..Default::default() },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_chain_completes_with_last_block() {
        let store = DeploymentChainStore::new(filedb(), Commander::Ops);
        store.add(chain()).await.unwrap();
        assert_eq!(store.list_not_completed().await.unwrap().len(), 1);

        let d = Deployment {
            id: "d-b".into(),
            application_id: "b".into(),
            deployment_chain_id: "chain".into(),
            deployment_chain_block_index: 1,
            ..Default::default()
        };
        store.add_deployment_to_block("chain", &d).await.unwrap();
        let c = store
            .update_node_deployment_status("chain", 1, "d-b", DeploymentStatus::DeploymentSuccess, "")
            .await
            .unwrap();
        assert_eq!(c.status, ChainStatus::DeploymentChainSuccess);
        assert!(c.completed_at > 0);
        assert!(store.list_not_completed().await.unwrap().is_empty());
    }
}
