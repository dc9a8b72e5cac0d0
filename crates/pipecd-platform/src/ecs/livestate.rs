//! Live state of the ECS services a piped manages

use super::client::EcsApi;
use super::manifest::Manifests;
use super::taskset::{LABEL_APPLICATION, LABEL_PIPED, TaskSetStatus, is_managed};
use super::types::{Service, TaskDefinition, TaskSet};
use parking_lot::RwLock;
use pipecd_common::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TAG_PREFIX: &str = "pipecd-dev-";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LiveManifests {
    pub service: Service,
    /// Task definition of the primary task set
    pub task_definition: TaskDefinition,
    pub task_sets: Vec<TaskSet>,
}

impl LiveManifests {
    /// The live definitions with piped's own tags removed
    pub fn to_manifests(&self) -> Manifests {
        let mut service = self.service.clone();
        service.tags.retain(|t| !t.key.starts_with(TAG_PREFIX));
        Manifests {
            service_definition: service,
            task_definition: self.task_definition.clone(),
        }
    }
}

pub struct LiveStateStore {
    api: Arc<dyn EcsApi>,
    piped_id: String,
    apps: RwLock<HashMap<String, LiveManifests>>,
}

fn tag<'a>(service: &'a Service, key: &str) -> Option<&'a str> {
    service.tags.iter().find(|t| t.key == key).map(|t| t.value.as_str())
}

impl LiveStateStore {
    pub fn new(api: Arc<dyn EcsApi>, piped_id: impl Into<String>) -> Self {
        Self {
            api,
            piped_id: piped_id.into(),
            apps: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, application_id: &str) -> Option<LiveManifests> {
        self.apps.read().get(application_id).cloned()
    }

    /// Rebuild the state from every cluster; returns the number of applications
    pub async fn refresh(&self) -> Result<usize> {
        let mut apps = HashMap::new();
        for cluster in self.api.list_clusters().await? {
            let arns = self.api.list_services(&cluster).await?;
            if arns.is_empty() {
                continue;
            }
            for service in self.api.describe_services(&cluster, &arns).await? {
                if !is_managed(&service.tags) || tag(&service, LABEL_PIPED) != Some(self.piped_id.as_str()) {
                    continue;
                }
                let Some(app_id) = tag(&service, LABEL_APPLICATION).map(str::to_string) else {
                    continue;
                };
                let Some(primary) = service
                    .task_sets
                    .iter()
                    .find(|ts| TaskSetStatus::parse(&ts.status) == TaskSetStatus::Primary)
                else {
                    debug!(service = %service.service_name, "service has no primary task set yet");
                    continue;
                };
                let task_definition = self.api.describe_task_definition(&primary.task_definition).await?;
                let task_sets = service.task_sets.clone();
                apps.insert(
                    app_id,
                    LiveManifests {
                        service,
                        task_definition,
                        task_sets,
                    },
                );
            }
        }
        let n = apps.len();
        *self.apps.write() = apps;
        metrics::gauge!("ecs_livestate_applications").set(n as f64);
        Ok(n)
    }

    pub async fn run(&self, interval: Duration, token: CancellationToken) -> Result<()> {
        info!(interval = ?interval, "start ecs live state store");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = token.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "failed to refresh ecs live state");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::taskset::testing::FakeEcs;
    use crate::ecs::taskset::{apply_service_definition, create_primary_task_set, managed_tags};
    use crate::ecs::types::{DeploymentController, Tag};

    fn definition(name: &str) -> Service {
        Service {
            service_name: name.into(),
            cluster_arn: "arn:cluster".into(),
            desired_count: 1,
            deployment_controller: Some(DeploymentController { kind: "EXTERNAL".into() }),
            tags: vec![Tag::new("team", "web")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_refresh_keeps_only_own_services() {
        let ecs = Arc::new(FakeEcs::default());
        let td = TaskDefinition { family: "web".into(), ..Default::default() };

        let mine = apply_service_definition(ecs.as_ref(), &definition("web"), &managed_tags("piped-1", "app-1", "c"))
            .await
            .unwrap();
        create_primary_task_set(ecs.as_ref(), &mine, &td, &[]).await.unwrap();
        let other = apply_service_definition(ecs.as_ref(), &definition("api"), &managed_tags("piped-2", "app-2", "c"))
            .await
            .unwrap();
        create_primary_task_set(ecs.as_ref(), &other, &td, &[]).await.unwrap();
        apply_service_definition(ecs.as_ref(), &definition("idle"), &managed_tags("piped-1", "app-3", "c"))
            .await
            .unwrap();

        let store = LiveStateStore::new(ecs, "piped-1");
        assert_eq!(store.refresh().await.unwrap(), 1);
        let live = store.get("app-1").unwrap();
        assert_eq!(live.task_definition.family, "web");
        assert!(store.get("app-2").is_none());

        let manifests = live.to_manifests();
        assert_eq!(manifests.service_definition.tags, vec![Tag::new("team", "web")]);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = LiveStateStore::new(Arc::new(FakeEcs::default()), "piped-1");
        let token = CancellationToken::new();
        token.cancel();
        store.run(Duration::from_secs(60), token).await.unwrap();
    }
}
