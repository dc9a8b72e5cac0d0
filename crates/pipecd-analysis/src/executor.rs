//! ANALYSIS stage executor
//!
//! Every probe runs as one task of a [`Group`]. A watcher next to the group
//! enforces the deadline (`duration` minus the time already spent in
//! earlier runs of the stage), polls for a skip request and persists the
//! elapsed time. The stage succeeds when the group ends without error.

use crate::analyzer::{Analyzer, LogProbe, MetricsProbe};
use crate::config::{AnalysisStageOptions, AnalysisTemplateSpec};
use crate::provider::{HttpProbe, ProviderRegistry};
use crate::template::TemplateArgs;
use async_trait::async_trait;
use pipecd_common::model::{AnalysisResult, CommandType, StageStatus, now_unix};
use pipecd_common::{Error, Result};
use pipecd_datastore::{CommandStore, DeploymentStore};
use pipecd_runtime::Group;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stage metadata key holding the time already spent, e.g. `4m30s`
pub const ELAPSED_TIME_KEY: &str = "elapsedTime";
pub const SKIP_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisOutcome {
    Success,
    Failure(String),
    Skipped,
    /// Stopped from outside before the deadline; the stage can resume later
    Cancelled,
}

impl AnalysisOutcome {
    pub const fn stage_status(&self) -> StageStatus {
        match self {
            Self::Success => StageStatus::StageSuccess,
            Self::Failure(_) => StageStatus::StageFailure,
            Self::Skipped => StageStatus::StageSkipped,
            Self::Cancelled => StageStatus::StageCancelled,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure(_) => "failure",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Latest successful analysis of one application
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn get_latest(&self) -> Result<AnalysisResult>;
    async fn put_latest(&self, result: &AnalysisResult) -> Result<()>;
}

/// Elapsed time of the running stage
#[async_trait]
pub trait StageMetadata: Send + Sync {
    /// Time spent in previous runs; zero when never saved
    async fn elapsed(&self) -> Result<Duration>;
    async fn save_elapsed(&self, elapsed: Duration) -> Result<()>;
}

#[async_trait]
pub trait SkipSignal: Send + Sync {
    async fn skip_requested(&self) -> Result<bool>;
}

pub struct StageInput {
    pub application_id: String,
    pub application_name: String,
    pub application_env: String,
    pub deployment_id: String,
    pub stage_id: String,
    pub options: AnalysisStageOptions,
    /// Application-wide custom args, overridden per probe
    pub app_custom_args: BTreeMap<String, String>,
    /// Directory holding `analysis-template.yaml`, at the head commit
    pub shared_config_dir: Option<PathBuf>,
}

pub struct Executor {
    providers: Arc<ProviderRegistry>,
    results: Arc<dyn ResultStore>,
    metadata: Arc<dyn StageMetadata>,
    skip: Arc<dyn SkipSignal>,
}

#[derive(Debug, PartialEq, Eq)]
enum Stop {
    Deadline,
    Skipped,
    /// The group ended on its own or was cancelled from outside
    Ended,
}

impl Executor {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        results: Arc<dyn ResultStore>,
        metadata: Arc<dyn StageMetadata>,
        skip: Arc<dyn SkipSignal>,
    ) -> Self {
        Self {
            providers,
            results,
            metadata,
            skip,
        }
    }

    pub async fn execute(&self, input: &StageInput, token: &CancellationToken) -> AnalysisOutcome {
        let outcome = self.run(input, token).await;
        metrics::counter!("analysis_stage_total", "outcome" => outcome.label()).increment(1);
        info!(deployment = %input.deployment_id, stage = %input.stage_id, outcome = outcome.label(), "analysis stage finished");
        outcome
    }

    async fn run(&self, input: &StageInput, token: &CancellationToken) -> AnalysisOutcome {
        if let Err(e) = input.options.validate() {
            return AnalysisOutcome::Failure(e.to_string());
        }
        let spent = match self.metadata.elapsed().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "failed to read the elapsed time, starting from zero");
                Duration::ZERO
            }
        };
        let remaining = input.options.duration.as_std().saturating_sub(spent);
        let stage_start = started_at(now_unix(), spent);
        info!(spent = ?spent, remaining = ?remaining, "starting analysis");

        let analyzers = match self.build_analyzers(input, stage_start) {
            Ok(a) => a,
            Err(e) => return AnalysisOutcome::Failure(e.to_string()),
        };
        let save_interval = analyzers
            .iter()
            .map(|a| a.interval)
            .min()
            .unwrap_or(DEFAULT_SAVE_INTERVAL);

        let mut group = Group::new(token);
        for analyzer in analyzers {
            let name = analyzer.id.clone();
            group.spawn(name, move |t| analyzer.run(t));
        }
        let group_token = group.token();
        let done = CancellationToken::new();
        let started = Instant::now();

        let wait = async {
            let result = group.wait().await;
            done.cancel();
            result
        };
        let watch = self.watch(remaining, save_interval, spent, started, &group_token, &done);
        let (result, stop) = tokio::join!(wait, watch);

        let total = spent + started.elapsed();
        if let Err(e) = self.metadata.save_elapsed(total).await {
            warn!(error = %e, "failed to save the elapsed time");
        }

        match (result, stop) {
            (_, Stop::Skipped) => AnalysisOutcome::Skipped,
            (Err(e), _) => AnalysisOutcome::Failure(e.to_string()),
            (Ok(()), Stop::Ended) if token.is_cancelled() => AnalysisOutcome::Cancelled,
            (Ok(()), _) => {
                let result = AnalysisResult { start_time: stage_start };
                if let Err(e) = self.results.put_latest(&result).await {
                    warn!(error = %e, "failed to save the analysis result");
                }
                AnalysisOutcome::Success
            }
        }
    }

    async fn watch(
        &self,
        remaining: Duration,
        save_interval: Duration,
        spent: Duration,
        started: Instant,
        group: &CancellationToken,
        done: &CancellationToken,
    ) -> Stop {
        let deadline = tokio::time::sleep(remaining);
        tokio::pin!(deadline);
        let mut skip_poll = tokio::time::interval_at(started + SKIP_POLL_INTERVAL, SKIP_POLL_INTERVAL);
        skip_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut save = tokio::time::interval_at(started + save_interval, save_interval);
        save.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.cancelled() => return Stop::Ended,
                _ = group.cancelled() => return Stop::Ended,
                _ = &mut deadline => {
                    info!("analysis duration reached");
                    group.cancel();
                    return Stop::Deadline;
                }
                _ = skip_poll.tick() => match self.skip.skip_requested().await {
                    Ok(true) => {
                        info!("skip requested, stopping analysis");
                        group.cancel();
                        return Stop::Skipped;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "failed to check for a skip request"),
                },
                _ = save.tick() => {
                    if let Err(e) = self.metadata.save_elapsed(spent + started.elapsed()).await {
                        warn!(error = %e, "failed to save the elapsed time");
                    }
                }
            }
        }
    }

    fn build_analyzers(&self, input: &StageInput, stage_start: i64) -> Result<Vec<Analyzer>> {
        let opts = &input.options;
        let uses_template = opts.metrics.iter().any(|m| !m.template.name.is_empty())
            || opts.logs.iter().any(|l| !l.template.name.is_empty())
            || opts.https.iter().any(|h| !h.template.name.is_empty());
        let template = if uses_template {
            let dir = input
                .shared_config_dir
                .as_deref()
                .ok_or_else(|| Error::not_found("no shared config directory to load the analysis template from"))?;
            AnalysisTemplateSpec::load(dir)?
        } else {
            AnalysisTemplateSpec::default()
        };
        let base_args =
            TemplateArgs::new(&input.application_name, &input.application_env).with_app_args(&input.app_custom_args);

        let mut analyzers = Vec::new();
        for (i, m) in opts.metrics.iter().enumerate() {
            let cfg = from_template(&m.template.name, &m.analysis, &template.metrics)?;
            cfg.validate()?;
            let provider = self.providers.metrics_provider(&cfg.provider)?;
            analyzers.push(Analyzer {
                id: format!("metrics-{i}"),
                interval: cfg.interval.as_std(),
                failure_limit: cfg.failure_limit,
                skip_on_no_data: cfg.skip_on_no_data,
                timeout: cfg.timeout.as_std(),
                probe: Box::new(MetricsProbe {
                    args: base_args.with_app_args(&m.template.app_args),
                    provider,
                    results: self.results.clone(),
                    stage_start,
                    cfg,
                }),
            });
        }
        for (i, l) in opts.logs.iter().enumerate() {
            let cfg = from_template(&l.template.name, &l.analysis, &template.logs)?;
            let args = base_args.with_app_args(&l.template.app_args);
            analyzers.push(Analyzer {
                id: format!("log-{i}"),
                interval: cfg.interval.as_std(),
                failure_limit: cfg.failure_limit,
                skip_on_no_data: cfg.skip_on_no_data,
                timeout: cfg.timeout.as_std(),
                probe: Box::new(LogProbe {
                    query: args.render(&cfg.query)?,
                    interval: cfg.interval.as_std(),
                    provider: self.providers.log_provider(&cfg.provider)?,
                }),
            });
        }
        for (i, h) in opts.https.iter().enumerate() {
            let mut cfg = from_template(&h.template.name, &h.analysis, &template.https)?;
            let args = base_args.with_app_args(&h.template.app_args);
            cfg.url = args.render(&cfg.url)?;
            for header in &mut cfg.custom_headers {
                header.value = args.render(&header.value)?;
            }
            analyzers.push(Analyzer {
                id: format!("http-{i}"),
                interval: cfg.interval.as_std(),
                failure_limit: cfg.failure_limit,
                skip_on_no_data: cfg.skip_on_no_data,
                timeout: cfg.timeout.as_std(),
                probe: Box::new(HttpProbe::new(cfg)?),
            });
        }
        Ok(analyzers)
    }
}

/// Unix time the stage began, given the time already spent
fn started_at(now: i64, spent: Duration) -> i64 {
    now.saturating_sub(i64::try_from(spent.as_secs()).unwrap_or(i64::MAX))
}

fn from_template<T: Clone>(name: &str, inline: &T, templates: &BTreeMap<String, T>) -> Result<T> {
    if name.is_empty() {
        return Ok(inline.clone());
    }
    templates
        .get(name)
        .cloned()
        .ok_or_else(|| Error::not_found(format!("analysis template {name} not found despite being referenced")))
}

// ---- Store adapters ----

/// [`ResultStore`] over the shared filestore/cache result store
pub struct ApplicationResults {
    store: Arc<pipecd_stores::AnalysisResultStore>,
    application_id: String,
}

impl ApplicationResults {
    pub fn new(store: Arc<pipecd_stores::AnalysisResultStore>, application_id: impl Into<String>) -> Self {
        Self {
            store,
            application_id: application_id.into(),
        }
    }
}

#[async_trait]
impl ResultStore for ApplicationResults {
    async fn get_latest(&self) -> Result<AnalysisResult> {
        self.store.get_latest(&self.application_id).await
    }

    async fn put_latest(&self, result: &AnalysisResult) -> Result<()> {
        self.store.put_latest(&self.application_id, result).await
    }
}

/// [`StageMetadata`] kept in the metadata of the deployment stage
pub struct DeploymentStageMetadata {
    deployments: Arc<DeploymentStore>,
    deployment_id: String,
    stage_id: String,
}

impl DeploymentStageMetadata {
    pub fn new(deployments: Arc<DeploymentStore>, deployment_id: impl Into<String>, stage_id: impl Into<String>) -> Self {
        Self {
            deployments,
            deployment_id: deployment_id.into(),
            stage_id: stage_id.into(),
        }
    }
}

#[async_trait]
impl StageMetadata for DeploymentStageMetadata {
    async fn elapsed(&self) -> Result<Duration> {
        let deployment = self.deployments.get(&self.deployment_id).await?;
        let stage = deployment
            .stage(&self.stage_id)
            .ok_or_else(|| Error::not_found(format!("stage {} of deployment {}", self.stage_id, self.deployment_id)))?;
        match stage.metadata.get(ELAPSED_TIME_KEY) {
            Some(raw) => pipecd_common::duration::parse_duration(raw),
            None => Ok(Duration::ZERO),
        }
    }

    async fn save_elapsed(&self, elapsed: Duration) -> Result<()> {
        let metadata = BTreeMap::from([(
            ELAPSED_TIME_KEY.to_string(),
            pipecd_common::duration::format_duration(Duration::from_secs(elapsed.as_secs())),
        )]);
        self.deployments
            .merge_stage_metadata(&self.deployment_id, &self.stage_id, &metadata)
            .await
            .map(|_| ())
    }
}

/// [`SkipSignal`] raised by an unhandled `SKIP_STAGE` command
pub struct SkipCommands {
    commands: Arc<CommandStore>,
    piped_id: String,
    deployment_id: String,
    stage_id: String,
}

impl SkipCommands {
    pub fn new(
        commands: Arc<CommandStore>,
        piped_id: impl Into<String>,
        deployment_id: impl Into<String>,
        stage_id: impl Into<String>,
    ) -> Self {
        Self {
            commands,
            piped_id: piped_id.into(),
            deployment_id: deployment_id.into(),
            stage_id: stage_id.into(),
        }
    }
}

#[async_trait]
impl SkipSignal for SkipCommands {
    async fn skip_requested(&self) -> Result<bool> {
        let pending = self.commands.list_unhandled(&self.piped_id).await?;
        Ok(pending.iter().any(|c| {
            c.kind == CommandType::SkipStage && c.deployment_id == self.deployment_id && c.stage_id == self.stage_id
        }))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct MemoryResults(pub Mutex<Option<AnalysisResult>>);

    #[async_trait]
    impl ResultStore for MemoryResults {
        async fn get_latest(&self) -> Result<AnalysisResult> {
            self.0.lock().clone().ok_or_else(|| Error::not_found("no analysis result"))
        }

        async fn put_latest(&self, result: &AnalysisResult) -> Result<()> {
            *self.0.lock() = Some(result.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct MemoryMetadata {
        pub elapsed: Mutex<Duration>,
        pub saves: Mutex<usize>,
    }

    #[async_trait]
    impl StageMetadata for MemoryMetadata {
        async fn elapsed(&self) -> Result<Duration> {
            Ok(*self.elapsed.lock())
        }

        async fn save_elapsed(&self, elapsed: Duration) -> Result<()> {
            *self.elapsed.lock() = elapsed;
            *self.saves.lock() += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct Skip {
        pub after_polls: Option<usize>,
        pub polls: Mutex<usize>,
    }

    #[async_trait]
    impl SkipSignal for Skip {
        async fn skip_requested(&self) -> Result<bool> {
            let mut polls = self.polls.lock();
            *polls += 1;
            Ok(self.after_polls.is_some_and(|n| *polls >= n))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{MemoryMetadata, MemoryResults, Skip};
    use super::*;
    use crate::config::{AnalysisExpected, AnalysisMetrics, AnalysisTemplateRef, TemplatableAnalysisMetrics};
    use crate::provider::testing::{ScriptedMetrics, points};
    use pipecd_common::model::{Command, Deployment, PipelineStage};
    use pipecd_datastore::Commander;
    use pipecd_datastore::filedb::FileDb;

    struct Fixture {
        provider: Arc<ScriptedMetrics>,
        results: Arc<MemoryResults>,
        metadata: Arc<MemoryMetadata>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                provider: Arc::default(),
                results: Arc::default(),
                metadata: Arc::default(),
            }
        }

        fn executor(&self, skip: Skip) -> Executor {
            let mut registry = ProviderRegistry::default();
            registry.add_metrics("prom", self.provider.clone());
            Executor::new(Arc::new(registry), self.results.clone(), self.metadata.clone(), Arc::new(skip))
        }
    }

    fn input(duration_secs: u64, skip_on_no_data: bool) -> StageInput {
        let metrics = AnalysisMetrics {
            provider: "prom".into(),
            query: "errors{app=\"{{ .App.Name }}\"}".into(),
            expected: AnalysisExpected { min: None, max: Some(1.0) },
            interval: pipecd_common::Duration::from_secs(60),
            skip_on_no_data,
            ..Default::default()
        };
        StageInput {
            application_id: "app-1".into(),
            application_name: "web".into(),
            application_env: String::new(),
            deployment_id: "d1".into(),
            stage_id: "s1".into(),
            options: AnalysisStageOptions {
                duration: pipecd_common::Duration::from_secs(duration_secs),
                metrics: vec![TemplatableAnalysisMetrics { analysis: metrics, template: AnalysisTemplateRef::default() }],
                ..Default::default()
            },
            app_custom_args: BTreeMap::new(),
            shared_config_dir: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_stage_only_runs_the_remaining_time() {
        let fx = Fixture::new();
        *fx.metadata.elapsed.lock() = Duration::from_secs(240);
        let started = Instant::now();
        let before = now_unix();

        let outcome = fx.executor(Skip::default()).execute(&input(600, true), &CancellationToken::new()).await;
        assert_eq!(outcome, AnalysisOutcome::Success);
        assert_eq!(started.elapsed(), Duration::from_secs(360));
        assert_eq!(*fx.metadata.elapsed.lock(), Duration::from_secs(600));
        assert!(*fx.metadata.saves.lock() > 1);

        let result = fx.results.get_latest().await.unwrap();
        assert!((result.start_time - (before - 240)).abs() <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_point_fails_the_stage() {
        let fx = Fixture::new();
        fx.provider.push("errors{app=\"web\"}", Ok(points(&[0.5])));
        fx.provider.push("errors{app=\"web\"}", Ok(points(&[3.0])));
        let started = Instant::now();

        let outcome = fx.executor(Skip::default()).execute(&input(600, false), &CancellationToken::new()).await;
        assert!(matches!(&outcome, AnalysisOutcome::Failure(r) if r.contains("failure limit")));
        assert_eq!(outcome.stage_status(), StageStatus::StageFailure);
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        assert!(fx.results.get_latest().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_command_stops_the_stage() {
        let fx = Fixture::new();
        let started = Instant::now();
        let skip = Skip { after_polls: Some(2), ..Default::default() };
        let outcome = fx.executor(skip).execute(&input(600, true), &CancellationToken::new()).await;
        assert_eq!(outcome, AnalysisOutcome::Skipped);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
        assert_eq!(*fx.metadata.elapsed.lock(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parent_cancellation() {
        let fx = Fixture::new();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(90)).await;
            canceller.cancel();
        });
        let outcome = fx.executor(Skip::default()).execute(&input(600, true), &token).await;
        assert_eq!(outcome, AnalysisOutcome::Cancelled);
        assert_eq!(*fx.metadata.elapsed.lock(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_configuration_errors_fail_fast() {
        let fx = Fixture::new();
        let mut missing_provider = input(600, true);
        missing_provider.options.metrics[0].analysis.provider = "nope".into();
        let outcome = fx.executor(Skip::default()).execute(&missing_provider, &CancellationToken::new()).await;
        assert!(matches!(outcome, AnalysisOutcome::Failure(_)));

        let mut missing_template = input(600, true);
        missing_template.options.metrics[0].template.name = "errors".into();
        let outcome = fx.executor(Skip::default()).execute(&missing_template, &CancellationToken::new()).await;
        assert!(matches!(outcome, AnalysisOutcome::Failure(r) if r.contains("shared config")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_template_probe() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("analysis-template.yaml"),
            "kind: AnalysisTemplate\nspec:\n  metrics:\n    errors:\n      provider: prom\n      query: errors{job=\"{{ .AppCustomArgs.job }}\"}\n      expected:\n        max: 1\n      interval: 1m\n",
        )
        .unwrap();
        let fx = Fixture::new();
        fx.provider.push("errors{job=\"api\"}", Ok(points(&[5.0])));
        let mut input = input(600, true);
        input.shared_config_dir = Some(dir.path().to_path_buf());
        input.app_custom_args.insert("job".into(), "web".into());
        input.options.metrics[0].template = AnalysisTemplateRef {
            name: "errors".into(),
            app_args: BTreeMap::from([("job".into(), "api".into())]),
        };
        let outcome = fx.executor(Skip::default()).execute(&input, &CancellationToken::new()).await;
        assert!(matches!(outcome, AnalysisOutcome::Failure(_)));
        assert_eq!(fx.provider.calls.lock()[0].0, "errors{job=\"api\"}");
    }

    fn filedb() -> Arc<dyn pipecd_datastore::DataStore> {
        Arc::new(FileDb::new(
            Arc::new(pipecd_filestore::memory::MemoryStore::new()),
            Arc::new(pipecd_cache::MemoryCache::new(Duration::ZERO)),
        ))
    }

    #[test]
    fn test_started_at_saturates() {
        assert_eq!(started_at(1_000, Duration::from_secs(400)), 600);
        assert_eq!(started_at(1_000, Duration::ZERO), 1_000);
        assert_eq!(started_at(1_000, Duration::from_secs(u64::MAX)), 1_000 - i64::MAX);
    }

    #[tokio::test]
    async fn test_deployment_stage_metadata() {
        let deployments = Arc::new(DeploymentStore::new(filedb(), Commander::Piped));
        deployments
            .add(Deployment {
                id: "d1".into(),
                application_id: "app".into(),
                piped_id: "piped".into(),
                project_id: "p".into(),
                stages: vec![PipelineStage { id: "s1".into(), ..Default::default() }],
                ..Default::default()
            })
            .await
            .unwrap();
        let md = DeploymentStageMetadata::new(deployments.clone(), "d1", "s1");
        assert_eq!(md.elapsed().await.unwrap(), Duration::ZERO);
        md.save_elapsed(Duration::from_millis(240_700)).await.unwrap();
        assert_eq!(md.elapsed().await.unwrap(), Duration::from_secs(240));
        let d = deployments.get("d1").await.unwrap();
        assert_eq!(d.stage("s1").unwrap().metadata[ELAPSED_TIME_KEY], "4m");
    }

    #[tokio::test]
    async fn test_skip_commands() {
        let commands = Arc::new(CommandStore::new(filedb(), Commander::Web));
        let skip = SkipCommands::new(commands.clone(), "piped", "d1", "s1");
        assert!(!skip.skip_requested().await.unwrap());
        commands
            .add(Command {
                id: "c1".into(),
                piped_id: "piped".into(),
                project_id: "p".into(),
                deployment_id: "d1".into(),
                stage_id: "s1".into(),
                kind: CommandType::SkipStage,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(skip.skip_requested().await.unwrap());
    }

    #[tokio::test]
    async fn test_application_results() {
        let store = Arc::new(pipecd_stores::AnalysisResultStore::new(
            Arc::new(pipecd_filestore::memory::MemoryStore::new()),
            Arc::new(pipecd_cache::MemoryCache::new(Duration::from_secs(60))),
        ));
        let results = ApplicationResults::new(store.clone(), "app-1");
        assert!(results.get_latest().await.unwrap_err().is_not_found());
        results.put_latest(&AnalysisResult { start_time: 42 }).await.unwrap();
        assert_eq!(results.get_latest().await.unwrap().start_time, 42);
        assert!(store.get_latest("app-2").await.unwrap_err().is_not_found());
    }
}
