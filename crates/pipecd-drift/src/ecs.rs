//! Drift detector for ECS applications

use crate::git::{GitClient, GitRepo};
use crate::manifest_cache::ManifestCache;
use async_trait::async_trait;
use parking_lot::Mutex;
use pipecd_common::model::{Application, ApplicationKind, ApplicationSyncState, ApplicationSyncStatus, now_unix};
use pipecd_common::{Error, Result};
use pipecd_diff::{DiffOptions, DiffResult, Renderer, diff};
use pipecd_platform::ecs::{EcsApplicationConfig, LiveStateStore, Manifests, load_manifests};
use pipecd_platform::processor::SecretDecrypter;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DESIRED_COUNT_PATH: &str = "serviceDefinition.desiredCount";

pub trait ApplicationLister: Send + Sync {
    fn list_by_platform_provider(&self, provider: &str) -> Vec<Application>;
}

pub trait LiveStateGetter: Send + Sync {
    fn app_live_manifests(&self, app_id: &str) -> Option<Manifests>;
}

impl LiveStateGetter for LiveStateStore {
    fn app_live_manifests(&self, app_id: &str) -> Option<Manifests> {
        self.get(app_id).map(|live| live.to_manifests())
    }
}

#[async_trait]
pub trait SyncStateReporter: Send + Sync {
    async fn report_application_sync_state(&self, app_id: &str, state: &ApplicationSyncState) -> Result<()>;
}

/// Repository entry of the piped configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepositoryConfig {
    pub repo_id: String,
    pub remote: String,
    pub branch: String,
}

pub struct EcsDetector {
    provider: String,
    apps: Arc<dyn ApplicationLister>,
    git: Arc<dyn GitClient>,
    live: Arc<dyn LiveStateGetter>,
    reporter: Arc<dyn SyncStateReporter>,
    manifests: ManifestCache,
    repositories: Vec<RepositoryConfig>,
    decrypter: Option<Arc<dyn SecretDecrypter>>,
    interval: Duration,
    repos: tokio::sync::Mutex<HashMap<String, Box<dyn GitRepo>>>,
    sync_states: Mutex<HashMap<String, ApplicationSyncState>>,
}

fn short_commit(hash: &str) -> &str {
    hash.get(..7).unwrap_or(hash)
}

fn diff_options() -> DiffOptions {
    DiffOptions::default()
        .ignore_adding_map_keys()
        .equate_empty()
        .compare_number_and_numeric_string()
}

fn is_unset(v: Option<&Value>) -> bool {
    v.is_none_or(Value::is_null)
}

/// Clear the fields ECS fills in or reorders on its own so they never show up
/// as drift. Applied to both the head and the live manifests.
pub fn ignore_parameters(manifests: &mut Manifests) {
    let service = &mut manifests.service_definition;
    // piped adds its own tags on apply
    service.tags.clear();
    if let Some(vpc) = service
        .network_configuration
        .as_mut()
        .and_then(|n| n.get_mut("awsvpcConfiguration"))
    {
        for key in ["subnets", "securityGroups"] {
            if let Some(Value::Array(items)) = vpc.get_mut(key) {
                items.sort_by(|a, b| a.as_str().cmp(&b.as_str()));
            }
        }
    }

    let task = &mut manifests.task_definition;
    task.extra.remove("tags");
    for container in &mut task.container_definitions {
        if is_unset(container.extra.get("essential")) {
            container.extra.insert("essential".into(), Value::Bool(true));
        }
        let Some(Value::Array(mappings)) = container.extra.get_mut("portMappings") else {
            continue;
        };
        for mapping in mappings.iter_mut().filter_map(Value::as_object_mut) {
            mapping.remove("hostPort");
            if is_unset(mapping.get("protocol")) {
                mapping.insert("protocol".into(), Value::from("tcp"));
            }
        }
    }
}

/// True when the only difference is a desiredCount left at 0 in Git, which
/// hands scaling to an autoscaler
pub fn ignore_autoscaling_diff(result: &DiffResult) -> bool {
    matches!(result.nodes(), [node]
        if node.path_string == DESIRED_COUNT_PATH
            && node.value_x.as_ref().is_none_or(|v| v.as_i64() == Some(0)))
}

/// Sync state for the difference between the head (`x`) and live (`y`) trees
pub fn make_sync_state(result: &DiffResult, commit: &str, now: i64) -> ApplicationSyncState {
    if !result.has_diff() {
        return ApplicationSyncState::synced("", now);
    }
    if ignore_autoscaling_diff(result) {
        return ApplicationSyncState::synced("Ignore diff of desiredCount.", now);
    }
    let short = format!("There are {} differences between Git and the live state", result.num());
    let mut reason = format!(
        "Diff between the defined state in Git at commit {} and actual live state:\n\n--- Expected (Git)\n+++ Actual   (LiveState)\n\n",
        short_commit(commit)
    );
    reason.push_str(&Renderer::new().with_left_padding(1).render(result));
    ApplicationSyncState::out_of_sync(short, reason, now)
}

fn has_changed(prev: &ApplicationSyncState, next: &ApplicationSyncState) -> bool {
    prev.status != next.status || prev.short_reason != next.short_reason || prev.reason != next.reason
}

impl EcsDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        apps: Arc<dyn ApplicationLister>,
        git: Arc<dyn GitClient>,
        live: Arc<dyn LiveStateGetter>,
        reporter: Arc<dyn SyncStateReporter>,
        manifests: ManifestCache,
        repositories: Vec<RepositoryConfig>,
        decrypter: Option<Arc<dyn SecretDecrypter>>,
    ) -> Self {
        Self {
            provider: provider.into(),
            apps,
            git,
            live,
            reporter,
            manifests,
            repositories,
            decrypter,
            interval: DEFAULT_INTERVAL,
            repos: tokio::sync::Mutex::new(HashMap::new()),
            sync_states: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn provider_name(&self) -> &str {
        &self.provider
    }

    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(provider = %self.provider, "start running drift detector for ecs applications");
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!(provider = %self.provider, "drift detector for ecs applications has been stopped");
                    return Ok(());
                }
                _ = ticker.tick() => self.check().await,
            }
        }
    }

    /// One detection pass over every application of the provider
    pub async fn check(&self) {
        let mut by_repo: BTreeMap<String, Vec<Application>> = BTreeMap::new();
        for app in self.apps.list_by_platform_provider(&self.provider) {
            if app.kind != ApplicationKind::Ecs {
                continue;
            }
            by_repo.entry(app.git_path.repo.id.clone()).or_default().push(app);
        }

        let mut repos = self.repos.lock().await;
        for (repo_id, apps) in by_repo {
            if !repos.contains_key(&repo_id) {
                match self.clone_repository(&repo_id).await {
                    Ok(repo) => {
                        repos.insert(repo_id.clone(), repo);
                    }
                    Err(e) => {
                        error!(repo_id = %repo_id, error = %e, "failed to clone git repository");
                        continue;
                    }
                }
            }
            let Some(repo) = repos.get(&repo_id) else { continue };

            let branch = repo.cloned_branch().to_string();
            if let Err(e) = repo.pull(&branch).await {
                error!(repo_id = %repo_id, error = %e, "failed to pull repository branch");
                continue;
            }
            let head = match repo.latest_commit().await {
                Ok(head) => head,
                Err(e) => {
                    error!(repo_id = %repo_id, error = %e, "failed to get head commit hash");
                    continue;
                }
            };

            for app in &apps {
                if let Err(e) = self.check_application(app, repo.path(), &head).await {
                    metrics::counter!("drift_check_errors_total", "kind" => "ecs").increment(1);
                    error!(app_id = %app.id, error = %e, "failed to check application");
                }
            }
        }
    }

    async fn clone_repository(&self, repo_id: &str) -> Result<Box<dyn GitRepo>> {
        let cfg = self
            .repositories
            .iter()
            .find(|r| r.repo_id == repo_id)
            .ok_or_else(|| Error::not_found(format!("repository {repo_id} in piped configuration")))?;
        self.git.clone_repo(repo_id, &cfg.remote, &cfg.branch).await
    }

    async fn check_application(&self, app: &Application, repo_dir: &Path, head: &str) -> Result<()> {
        let mut head_manifests = self.load_head_manifests(app, repo_dir, head).await?;
        let Some(mut live) = self.live.app_live_manifests(&app.id) else {
            debug!(app_id = %app.id, "no live state yet");
            return Ok(());
        };
        ignore_parameters(&mut head_manifests);
        ignore_parameters(&mut live);

        let result = diff(&head_manifests.to_tree()?, &live.to_tree()?, &diff_options());
        let state = make_sync_state(&result, head, now_unix());
        self.report(&app.id, state).await
    }

    async fn load_head_manifests(&self, app: &Application, repo_dir: &Path, head: &str) -> Result<Manifests> {
        if let Some(m) = self.manifests.get(&app.id, head).await {
            return Ok(m);
        }
        let app_dir = repo_dir.join(&app.git_path.path);
        let cfg = EcsApplicationConfig::load(&app_dir.join(app.git_path.config_filename_or_default()))?;
        let processor = cfg.processor(&app_dir, self.decrypter.as_deref())?;
        let manifests = load_manifests(&processor, &cfg.spec.input)
            .map_err(|e| Error::invalid_argument(format!("failed to load head manifests: {e}")))?;
        self.manifests.put(&app.id, head, &manifests).await;
        Ok(manifests)
    }

    async fn report(&self, app_id: &str, state: ApplicationSyncState) -> Result<()> {
        let unchanged = self
            .sync_states
            .lock()
            .get(app_id)
            .is_some_and(|prev| !has_changed(prev, &state));
        if unchanged {
            return Ok(());
        }
        self.reporter.report_application_sync_state(app_id, &state).await?;
        if state.status == ApplicationSyncStatus::OutOfSync {
            info!(app_id, reason = %state.short_reason, "application is out of sync");
        }
        self.sync_states.lock().insert(app_id.to_string(), state);
        Ok(())
    }
}
