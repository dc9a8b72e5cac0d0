use super::EntityStore;
use crate::{ListOptions, Operator, Order};
use pipecd_common::model::{Deployment, DeploymentStatus, StageStatus, merge_metadata, now_unix};
use pipecd_common::Result;
use serde_json::Value;
use std::collections::BTreeMap;

impl EntityStore<Deployment> {
    /// Move to `status`; a terminal status also stamps `completed_at`
    pub async fn update_status(&self, id: &str, status: DeploymentStatus, reason: &str) -> Result<Deployment> {
        let now = now_unix();
        self.update(id, |d| {
            d.status = status;
            d.status_reason = reason.to_string();
            if status.is_completed() {
                d.completed_at = now;
            }
            Ok(())
        })
        .await
    }

    pub async fn update_completed(
        &self,
        id: &str,
        status: DeploymentStatus,
        stage_statuses: &BTreeMap<String, StageStatus>,
        reason: &str,
        completed_at: i64,
    ) -> Result<Deployment> {
        self.update(id, |d| d.complete(status, stage_statuses, reason, completed_at))
            .await
    }

    pub async fn update_stage_status(
        &self,
        id: &str,
        stage_id: &str,
        status: StageStatus,
        reason: &str,
        retried_count: i32,
        completed_at: i64,
    ) -> Result<Deployment> {
        self.update(id, |d| d.update_stage(stage_id, status, reason, retried_count, completed_at))
            .await
    }

    pub async fn merge_metadata(&self, id: &str, metadata: &BTreeMap<String, String>) -> Result<Deployment> {
        self.update(id, |d| {
            merge_metadata(&mut d.metadata, metadata);
            Ok(())
        })
        .await
    }

    pub async fn merge_stage_metadata(
        &self,
        id: &str,
        stage_id: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<Deployment> {
        self.update(id, |d| d.merge_stage_metadata(stage_id, metadata)).await
    }

    /// Attach the deployment to block `block_index` of a chain
    pub async fn update_to_be_chained(&self, id: &str, chain_id: &str, block_index: u32) -> Result<Deployment> {
        self.update(id, |d| {
            d.deployment_chain_id = chain_id.to_string();
            d.deployment_chain_block_index = block_index;
            Ok(())
        })
        .await
    }

    /// Deployments of `application_id` that have not reached a terminal status
    pub async fn list_not_completed(&self, application_id: &str) -> Result<Vec<Deployment>> {
        let statuses: Vec<Value> = DeploymentStatus::NOT_COMPLETED
            .iter()
            .map(|s| Value::from(s.as_str()))
            .collect();
        let opts = ListOptions::default()
            .filter("ApplicationId", Operator::Equal, application_id)
            .filter("Status", Operator::In, statuses)
            .order(Order::desc("CreatedAt"));
        self.list_all(&opts).await
    }
}
