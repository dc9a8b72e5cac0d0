//! Service and task-set rollout
//!
//! A service owns at most one `PRIMARY` task set. New task sets start
//! `ACTIVE`; promotion swaps the primary and the previous one is deleted,
//! which ECS reports as `DRAINING` until its tasks stop.

use super::client::EcsApi;
use super::types::{Service, Tag, TaskDefinition, TaskSet};
use pipecd_common::{Error, Result};
use std::fmt;
use tracing::{info, warn};

pub const LABEL_MANAGED_BY: &str = "pipecd-dev-managed-by";
pub const LABEL_PIPED: &str = "pipecd-dev-piped";
pub const LABEL_APPLICATION: &str = "pipecd-dev-application";
pub const LABEL_COMMIT_HASH: &str = "pipecd-dev-commit-hash";
pub const MANAGED_BY_PIPED: &str = "piped";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSetStatus {
    Primary,
    Active,
    Draining,
    Other,
}

impl TaskSetStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "PRIMARY" => Self::Primary,
            "ACTIVE" => Self::Active,
            "DRAINING" => Self::Draining,
            _ => Self::Other,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Active => "ACTIVE",
            Self::Draining => "DRAINING",
            Self::Other => "OTHER",
        }
    }

    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Active, Self::Primary) | (Self::Primary, Self::Active) | (Self::Active, Self::Draining)
        )
    }
}

impl fmt::Display for TaskSetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn managed_tags(piped_id: &str, application_id: &str, commit_hash: &str) -> Vec<Tag> {
    vec![
        Tag::new(LABEL_MANAGED_BY, MANAGED_BY_PIPED),
        Tag::new(LABEL_PIPED, piped_id),
        Tag::new(LABEL_APPLICATION, application_id),
        Tag::new(LABEL_COMMIT_HASH, commit_hash),
    ]
}

pub fn is_managed(tags: &[Tag]) -> bool {
    tags.iter().any(|t| t.key == LABEL_MANAGED_BY && t.value == MANAGED_BY_PIPED)
}

/// `base` with every key of `overrides` replaced or appended
fn merge_tags(base: &[Tag], overrides: &[Tag]) -> Vec<Tag> {
    let mut out: Vec<Tag> = base
        .iter()
        .filter(|t| !overrides.iter().any(|o| o.key == t.key))
        .cloned()
        .collect();
    out.extend_from_slice(overrides);
    out
}

/// The active service called `name` in `cluster`
pub async fn find_service(api: &dyn EcsApi, cluster: &str, name: &str) -> Result<Option<Service>> {
    let services = match api.describe_services(cluster, &[name.to_string()]).await {
        Ok(s) => s,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(services
        .into_iter()
        .find(|s| s.service_name == name && s.status == "ACTIVE"))
}

async fn task_set_tags(api: &dyn EcsApi, task_set: &TaskSet) -> Result<Vec<Tag>> {
    if task_set.tags.is_empty() {
        api.list_tags(&task_set.task_set_arn).await
    } else {
        Ok(task_set.tags.clone())
    }
}

/// Create the service, or update it when it exists and is managed by piped
pub async fn apply_service_definition(api: &dyn EcsApi, definition: &Service, tags: &[Tag]) -> Result<Service> {
    let name = &definition.service_name;
    match find_service(api, &definition.cluster_arn, name).await? {
        Some(existing) => {
            if !is_managed(&existing.tags) {
                return Err(Error::permission_denied(format!(
                    "service {name} exists but is not managed by piped"
                )));
            }
            let mut desired = definition.clone();
            desired.service_arn.clone_from(&existing.service_arn);
            let mut updated = api.update_service(&desired).await?;
            api.tag_resource(&existing.service_arn, tags).await?;
            updated.tags = merge_tags(&existing.tags, tags);
            info!(service = %name, "updated ecs service");
            Ok(updated)
        }
        None => {
            let mut desired = definition.clone();
            desired.tags = merge_tags(&definition.tags, tags);
            let created = api.create_service(&desired).await?;
            info!(service = %name, "created ecs service");
            Ok(created)
        }
    }
}

async fn current_task_sets(api: &dyn EcsApi, service: &Service) -> Result<Vec<TaskSet>> {
    let described = api
        .describe_services(&service.cluster_arn, &[service.reference().to_string()])
        .await?;
    described
        .into_iter()
        .next()
        .map(|s| s.task_sets)
        .ok_or_else(|| Error::not_found(format!("service {}", service.service_name)))
}

/// Register `task_definition` and roll it out as the only primary task set
///
/// The previous primary is deleted only when piped manages it.
pub async fn create_primary_task_set(
    api: &dyn EcsApi,
    service: &Service,
    task_definition: &TaskDefinition,
    tags: &[Tag],
) -> Result<TaskSet> {
    let previous = current_task_sets(api, service)
        .await?
        .into_iter()
        .find(|ts| TaskSetStatus::parse(&ts.status) == TaskSetStatus::Primary);

    let registered = api.register_task_definition(task_definition).await?;
    let created = api.create_task_set(service, &registered, 100.0, tags).await?;
    let status = TaskSetStatus::parse(&created.status);
    if !status.can_transition_to(TaskSetStatus::Primary) {
        return Err(Error::internal(format!(
            "task set {} is {status} and cannot become primary",
            created.task_set_arn
        )));
    }
    let primary = api
        .update_service_primary_task_set(service, &created.task_set_arn)
        .await?;

    if let Some(previous) = previous {
        if is_managed(&task_set_tags(api, &previous).await?) {
            api.delete_task_set(service, &previous.task_set_arn).await?;
        } else {
            warn!(task_set = %previous.task_set_arn, "previous primary task set is not managed by piped, keeping it");
        }
    }
    info!(service = %service.service_name, task_set = %primary.task_set_arn, "rolled out primary task set");
    Ok(primary)
}

/// Register `task_definition` and run it beside the primary at `scale_percent`
pub async fn create_canary_task_set(
    api: &dyn EcsApi,
    service: &Service,
    task_definition: &TaskDefinition,
    scale_percent: f64,
    tags: &[Tag],
) -> Result<TaskSet> {
    if !(0.0..=100.0).contains(&scale_percent) {
        return Err(Error::invalid_argument(format!("scale {scale_percent} is not a percentage")));
    }
    let registered = api.register_task_definition(task_definition).await?;
    api.create_task_set(service, &registered, scale_percent, tags).await
}

/// Delete every managed non-primary task set of `service`
pub async fn clean_task_sets(api: &dyn EcsApi, service: &Service) -> Result<usize> {
    let mut deleted = 0;
    for task_set in current_task_sets(api, service).await? {
        let status = TaskSetStatus::parse(&task_set.status);
        if !status.can_transition_to(TaskSetStatus::Draining) {
            continue;
        }
        if !is_managed(&task_set_tags(api, &task_set).await?) {
            warn!(task_set = %task_set.task_set_arn, "skip task set not managed by piped");
            continue;
        }
        api.delete_task_set(service, &task_set.task_set_arn).await?;
        deleted += 1;
    }
    Ok(deleted)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    /// In-memory ECS keeping services, task definitions and task sets
    #[derive(Default)]
    pub struct FakeEcs {
        pub services: Mutex<BTreeMap<String, Service>>,
        pub task_definitions: Mutex<BTreeMap<String, TaskDefinition>>,
        pub resource_tags: Mutex<BTreeMap<String, Vec<Tag>>>,
        pub calls: Mutex<Vec<String>>,
        next: Mutex<u32>,
    }

    impl FakeEcs {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().push(call.into());
        }

        fn next_id(&self) -> u32 {
            let mut n = self.next.lock();
            *n += 1;
            *n
        }

        pub fn add_service(&self, mut service: Service) {
            service.status = "ACTIVE".into();
            if service.service_arn.is_empty() {
                service.service_arn = format!("arn:svc/{}", service.service_name);
            }
            self.services.lock().insert(service.service_name.clone(), service);
        }

        pub fn task_sets(&self, service: &str) -> Vec<TaskSet> {
            self.services.lock().get(service).map(|s| s.task_sets.clone()).unwrap_or_default()
        }

        fn with_service<T>(&self, service: &Service, f: impl FnOnce(&mut Service) -> Result<T>) -> Result<T> {
            let mut services = self.services.lock();
            let svc = services
                .values_mut()
                .find(|s| s.service_arn == service.reference() || s.service_name == service.reference())
                .ok_or_else(|| Error::not_found(format!("service {}", service.reference())))?;
            f(svc)
        }
    }

    #[async_trait]
    impl EcsApi for FakeEcs {
        async fn create_service(&self, service: &Service) -> Result<Service> {
            self.record(format!("CreateService {}", service.service_name));
            if !service.uses_external_controller() {
                return Err(Error::invalid_argument("EXTERNAL is required"));
            }
            self.add_service(service.clone());
            let created = self.services.lock()[&service.service_name].clone();
            self.resource_tags.lock().insert(created.service_arn.clone(), created.tags.clone());
            Ok(created)
        }

        async fn update_service(&self, service: &Service) -> Result<Service> {
            self.record(format!("UpdateService {}", service.service_name));
            self.with_service(service, |svc| {
                svc.desired_count = service.desired_count;
                Ok(svc.clone())
            })
        }

        async fn describe_services(&self, _cluster: &str, names: &[String]) -> Result<Vec<Service>> {
            let services = self.services.lock();
            Ok(services
                .values()
                .filter(|s| names.iter().any(|n| *n == s.service_name || *n == s.service_arn))
                .cloned()
                .collect())
        }

        async fn list_clusters(&self) -> Result<Vec<String>> {
            let mut clusters: Vec<String> = self.services.lock().values().map(|s| s.cluster_arn.clone()).collect();
            clusters.dedup();
            Ok(clusters)
        }

        async fn list_services(&self, cluster: &str) -> Result<Vec<String>> {
            Ok(self
                .services
                .lock()
                .values()
                .filter(|s| s.cluster_arn == cluster)
                .map(|s| s.service_arn.clone())
                .collect())
        }

        async fn register_task_definition(&self, td: &TaskDefinition) -> Result<TaskDefinition> {
            self.record(format!("RegisterTaskDefinition {}", td.family));
            let revision = self.next_id();
            let mut registered = td.clone();
            registered.revision = i64::from(revision);
            registered.task_definition_arn = format!("arn:td/{}:{revision}", td.family);
            self.task_definitions
                .lock()
                .insert(registered.task_definition_arn.clone(), registered.clone());
            Ok(registered)
        }

        async fn describe_task_definition(&self, arn: &str) -> Result<TaskDefinition> {
            self.task_definitions
                .lock()
                .get(arn)
                .cloned()
                .ok_or_else(|| Error::not_found(format!("task definition {arn}")))
        }

        async fn create_task_set(&self, service: &Service, td: &TaskDefinition, scale: f64, tags: &[Tag]) -> Result<TaskSet> {
            self.record(format!("CreateTaskSet {}", td.task_definition_arn));
            let id = self.next_id();
            let task_set = TaskSet {
                id: format!("ecs-svc/{id}"),
                task_set_arn: format!("arn:ts/{id}"),
                status: "ACTIVE".into(),
                task_definition: td.task_definition_arn.clone(),
                scale: Some(super::super::types::Scale::percent(scale)),
                ..Default::default()
            };
            self.resource_tags.lock().insert(task_set.task_set_arn.clone(), tags.to_vec());
            self.with_service(service, |svc| {
                svc.task_sets.push(task_set.clone());
                Ok(task_set)
            })
        }

        async fn delete_task_set(&self, service: &Service, arn: &str) -> Result<()> {
            self.record(format!("DeleteTaskSet {arn}"));
            self.with_service(service, |svc| {
                let ts = svc
                    .task_sets
                    .iter_mut()
                    .find(|ts| ts.task_set_arn == arn)
                    .ok_or_else(|| Error::not_found(format!("task set {arn}")))?;
                ts.status = "DRAINING".into();
                Ok(())
            })
        }

        async fn update_service_primary_task_set(&self, service: &Service, arn: &str) -> Result<TaskSet> {
            self.record(format!("UpdateServicePrimaryTaskSet {arn}"));
            self.with_service(service, |svc| {
                let mut primary = None;
                for ts in &mut svc.task_sets {
                    if ts.task_set_arn == arn {
                        ts.status = "PRIMARY".into();
                        primary = Some(ts.clone());
                    } else if ts.status == "PRIMARY" {
                        ts.status = "ACTIVE".into();
                    }
                }
                primary.ok_or_else(|| Error::not_found(format!("task set {arn}")))
            })
        }

        async fn tag_resource(&self, arn: &str, tags: &[Tag]) -> Result<()> {
            self.record(format!("TagResource {arn}"));
            let mut all = self.resource_tags.lock();
            let merged = merge_tags(all.get(arn).map(Vec::as_slice).unwrap_or_default(), tags);
            all.insert(arn.to_string(), merged.clone());
            drop(all);
            let mut services = self.services.lock();
            if let Some(svc) = services.values_mut().find(|s| s.service_arn == arn) {
                svc.tags = merged;
            }
            Ok(())
        }

        async fn list_tags(&self, arn: &str) -> Result<Vec<Tag>> {
            Ok(self.resource_tags.lock().get(arn).cloned().unwrap_or_default())
        }
    }
}
