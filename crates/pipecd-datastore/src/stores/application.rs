use super::EntityStore;
use crate::{ListOptions, Operator};
use pipecd_common::model::{
    Application, ApplicationDeploymentReference, ApplicationSyncState, DeploymentStatus, now_unix,
};
use pipecd_common::Result;
use std::collections::BTreeMap;

impl EntityStore<Application> {
    pub async fn enable(&self, id: &str) -> Result<Application> {
        self.update(id, |app| {
            app.disabled = false;
            Ok(())
        })
        .await
    }

    pub async fn disable(&self, id: &str) -> Result<Application> {
        self.update(id, |app| {
            app.disabled = true;
            Ok(())
        })
        .await
    }

    /// Soft delete; the record stays until the retention janitor removes it
    pub async fn delete(&self, id: &str) -> Result<Application> {
        let now = now_unix();
        self.update(id, |app| {
            app.deleted = true;
            app.deleted_at = now;
            app.disabled = true;
            Ok(())
        })
        .await
    }

    pub async fn update_sync_state(&self, id: &str, state: ApplicationSyncState) -> Result<Application> {
        self.update(id, |app| {
            app.sync_state = Some(state.clone());
            Ok(())
        })
        .await
    }

    pub async fn update_deploying_status(&self, id: &str, deploying: bool) -> Result<Application> {
        self.update(id, |app| {
            app.deploying = deploying;
            Ok(())
        })
        .await
    }

    /// Record `reference` as the latest triggered or successful deployment
    pub async fn update_most_recent_deployment(
        &self,
        id: &str,
        status: DeploymentStatus,
        reference: ApplicationDeploymentReference,
    ) -> Result<Application> {
        self.update(id, |app| {
            match status {
                DeploymentStatus::DeploymentSuccess => {
                    app.most_recently_successful_deployment = Some(reference.clone());
                }
                DeploymentStatus::DeploymentPending => {
                    app.most_recently_triggered_deployment = Some(reference.clone());
                }
                _ => {}
            }
            Ok(())
        })
        .await
    }

    pub async fn update_basic_info(
        &self,
        id: &str,
        name: &str,
        description: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Application> {
        self.update(id, |app| {
            app.name = name.to_string();
            app.description = description.to_string();
            app.labels = labels.clone();
            Ok(())
        })
        .await
    }

    /// Live applications managed by `piped_id`
    pub async fn list_by_piped(&self, piped_id: &str) -> Result<Vec<Application>> {
        let opts = ListOptions::default()
            .filter("PipedId", Operator::Equal, piped_id)
            .filter("Deleted", Operator::Equal, false);
        self.list_all(&opts).await
    }
}

#[cfg(test)]
mod tests {
    use crate::stores::testing::filedb;
    use crate::{ApplicationStore, Commander};
    use pipecd_common::model::{
        Application, ApplicationDeploymentReference, ApplicationSyncState, ApplicationSyncStatus,
        DeploymentStatus,
    };

    fn app(id: &str) -> Application {
        Application {
            id: id.into(),
            name: "web".into(),
            piped_id: "piped-1".into(),
            project_id: "p".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_agent_and_web_writes_merge() {
        let ds = filedb();
        let web = ApplicationStore::new(ds.clone(), Commander::Web);
        let piped = ApplicationStore::new(ds, Commander::Piped);
        web.add(app("a1")).await.unwrap();

        piped
            .update_sync_state("a1", ApplicationSyncState::synced("ok", 10))
            .await
            .unwrap();
        web.update_basic_info("a1", "renamed", "desc", &Default::default())
            .await
            .unwrap();

        let got = web.get("a1").await.unwrap();
        assert_eq!(got.name, "renamed");
        assert_eq!(got.sync_state.unwrap().status, ApplicationSyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_delete_is_soft() {
        let web = ApplicationStore::new(filedb(), Commander::Web);
        web.add(app("a1")).await.unwrap();
        web.add(app("a2")).await.unwrap();
        web.delete("a1").await.unwrap();

        let got = web.get("a1").await.unwrap();
        assert!(got.deleted && got.disabled);
        assert!(got.deleted_at > 0);
        let live = web.list_by_piped("piped-1").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "a2");
    }

    #[tokio::test]
    async fn test_most_recent_deployment() {
        let ds = filedb();
        let web = ApplicationStore::new(ds.clone(), Commander::Web);
        let piped = ApplicationStore::new(ds, Commander::Piped);
        web.add(app("a1")).await.unwrap();

        let reference = ApplicationDeploymentReference {
            deployment_id: "d1".into(),
            ..Default::default()
        };
        piped
            .update_most_recent_deployment("a1", DeploymentStatus::DeploymentPending, reference.clone())
            .await
            .unwrap();
        let got = web.get("a1").await.unwrap();
        assert_eq!(got.most_recently_triggered_deployment, Some(reference));
        assert!(got.most_recently_successful_deployment.is_none());
    }
}
