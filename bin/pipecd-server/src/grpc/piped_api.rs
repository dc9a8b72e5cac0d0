//! Agent-facing API
//!
//! Every call is made by one piped and may only touch the applications,
//! deployments and commands that piped owns.

use super::{Deps, Endpoint, from_json, parse_enum, require_fields, sorted, to_json_all};
use crate::auth::{PipedIdentity, PipedTokenAuth};
use bytes::Bytes;
use pipecd_common::model::{
    AnalysisResult, Application, ApplicationDeploymentReference, ApplicationGitRepository, ApplicationSyncState,
    Command, Deployment, DeploymentStatus, PipelineStage, PlatformProvider, StageStatus, now_unix,
};
use pipecd_common::{ControlPlaneConfig, Error, Result};
use pipecd_datastore::{
    ApplicationStore, CommandStore, Commander, DeploymentChainStore, DeploymentStore, PipedMetadata, PipedStore,
};
use pipecd_proto::pipedservice::piped_service_server::{PipedService, PipedServiceServer};
use pipecd_proto::pipedservice::{
    CreateDeploymentRequest, CreateDeploymentResponse, GetApplicationSharedObjectRequest,
    GetApplicationSharedObjectResponse, GetLatestAnalysisResultRequest, GetLatestAnalysisResultResponse,
    ListApplicationsRequest, ListApplicationsResponse, ListUnhandledCommandsRequest,
    ListUnhandledCommandsResponse, PingRequest, PingResponse, PutApplicationSharedObjectRequest,
    PutApplicationSharedObjectResponse, PutLatestAnalysisResultRequest, PutLatestAnalysisResultResponse,
    ReportApplicationDeployingStatusRequest, ReportApplicationDeployingStatusResponse,
    ReportApplicationSyncStateRequest, ReportApplicationSyncStateResponse, ReportCommandHandledRequest,
    ReportCommandHandledResponse, ReportDeploymentCompletedRequest, ReportDeploymentCompletedResponse,
    ReportDeploymentPlannedRequest, ReportDeploymentPlannedResponse, ReportDeploymentStatusChangedRequest,
    ReportDeploymentStatusChangedResponse, ReportPipedMetaRequest, ReportPipedMetaResponse,
    ReportPlanPreviewOutputRequest, ReportPlanPreviewOutputResponse, ReportStageLogsRequest, ReportStageLogsResponse,
    ReportStageStatusChangedRequest, ReportStageStatusChangedResponse,
    ReportUnregisteredApplicationConfigurationsRequest, ReportUnregisteredApplicationConfigurationsResponse,
    SaveStageMetadataRequest, SaveStageMetadataResponse,
};
use pipecd_stores::{
    AnalysisResultStore, ApplicationInfo, CommandOutputStore, LogBlock, PipedStat, PipedStatStore, SharedObjectStore,
    StageLogStore, UnregisteredAppStore,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tonic::{Request, Response, Status};

require_fields! {
    PingRequest => [];
    ReportPipedMetaRequest => [version];
    ListApplicationsRequest => [];
    ReportApplicationSyncStateRequest => [application_id];
    ReportApplicationDeployingStatusRequest => [application_id];
    ReportUnregisteredApplicationConfigurationsRequest => [];
    ListUnhandledCommandsRequest => [];
    ReportCommandHandledRequest => [command_id, status];
    CreateDeploymentRequest => [deployment_json];
    ReportDeploymentPlannedRequest => [deployment_id];
    ReportDeploymentStatusChangedRequest => [deployment_id, status];
    ReportDeploymentCompletedRequest => [deployment_id, status];
    ReportStageStatusChangedRequest => [deployment_id, stage_id, status];
    SaveStageMetadataRequest => [deployment_id, stage_id];
    ReportStageLogsRequest => [deployment_id, stage_id];
    GetLatestAnalysisResultRequest => [application_id];
    PutLatestAnalysisResultRequest => [application_id];
    GetApplicationSharedObjectRequest => [application_id, plugin_name, key];
    PutApplicationSharedObjectRequest => [application_id, plugin_name, key];
    ReportPlanPreviewOutputRequest => [command_id];
}

pub struct PipedApi {
    endpoint: Endpoint<PipedTokenAuth>,
    handler: Handler,
}

impl PipedApi {
    pub fn new(deps: &Deps, auth: Arc<PipedTokenAuth>) -> Self {
        Self {
            endpoint: Endpoint::new("PipedService", auth),
            handler: Handler::new(deps),
        }
    }

    pub fn into_server(self) -> PipedServiceServer<Self> {
        PipedServiceServer::new(self)
    }
}

struct Handler {
    applications: ApplicationStore,
    deployments: DeploymentStore,
    commands: CommandStore,
    pipeds: PipedStore,
    chains: DeploymentChainStore,
    stage_logs: StageLogStore,
    analysis: AnalysisResultStore,
    shared_objects: SharedObjectStore,
    command_outputs: CommandOutputStore,
    piped_stats: Arc<PipedStatStore>,
    unregistered_apps: Arc<UnregisteredAppStore>,
    config: Arc<ControlPlaneConfig>,
}

fn deployment_reference(d: &Deployment) -> ApplicationDeploymentReference {
    ApplicationDeploymentReference {
        deployment_id: d.id.clone(),
        summary: d.summary.clone(),
        version: d.version.clone(),
        config_filename: d.git_path.config_filename.clone(),
        versions: d.versions.clone(),
        started_at: d.created_at,
        completed_at: d.completed_at,
    }
}

impl Handler {
    fn new(deps: &Deps) -> Self {
        let ds = &deps.datastore;
        Self {
            applications: ApplicationStore::new(ds.clone(), Commander::Piped),
            deployments: DeploymentStore::new(ds.clone(), Commander::Piped),
            commands: CommandStore::new(ds.clone(), Commander::Piped),
            pipeds: PipedStore::new(ds.clone(), Commander::Piped),
            chains: DeploymentChainStore::new(ds.clone(), Commander::Piped),
            stage_logs: StageLogStore::new(deps.filestore.clone(), deps.cache.clone()),
            analysis: AnalysisResultStore::new(deps.filestore.clone(), deps.cache.clone()),
            shared_objects: SharedObjectStore::new(deps.filestore.clone()),
            command_outputs: CommandOutputStore::new(deps.filestore.clone()),
            piped_stats: deps.piped_stats.clone(),
            unregistered_apps: deps.unregistered_apps.clone(),
            config: deps.config.clone(),
        }
    }

    async fn application(&self, id: &PipedIdentity, application_id: &str) -> Result<Application> {
        let app = self.applications.get(application_id).await?;
        if app.piped_id != id.piped_id {
            return Err(Error::permission_denied(format!(
                "application {application_id} does not belong to piped {}",
                id.piped_id
            )));
        }
        Ok(app)
    }

    async fn deployment(&self, id: &PipedIdentity, deployment_id: &str) -> Result<Deployment> {
        let d = self.deployments.get(deployment_id).await?;
        if d.piped_id != id.piped_id {
            return Err(Error::permission_denied(format!(
                "deployment {deployment_id} does not belong to piped {}",
                id.piped_id
            )));
        }
        Ok(d)
    }

    async fn command(&self, id: &PipedIdentity, command_id: &str) -> Result<Command> {
        let c = self.commands.get(command_id).await?;
        if c.piped_id != id.piped_id {
            return Err(Error::permission_denied(format!(
                "command {command_id} is not addressed to piped {}",
                id.piped_id
            )));
        }
        Ok(c)
    }

    async fn update_chain_node(
        &self,
        chain_id: &str,
        block_index: u32,
        deployment_id: &str,
        status: DeploymentStatus,
        reason: &str,
    ) -> Result<()> {
        if chain_id.is_empty() {
            return Ok(());
        }
        self.chains
            .update_node_deployment_status(chain_id, block_index as usize, deployment_id, status, reason)
            .await?;
        Ok(())
    }

    async fn ping(&self, id: PipedIdentity, req: PingRequest) -> Result<PingResponse> {
        let metrics = req
            .stat
            .map(|s| String::from_utf8_lossy(&s.metrics).into_owned())
            .unwrap_or_default();
        let stat = PipedStat {
            piped_id: id.piped_id,
            metrics,
            timestamp: now_unix(),
        };
        self.piped_stats.put(&stat).await?;
        Ok(PingResponse {})
    }

    async fn report_piped_meta(&self, id: PipedIdentity, req: ReportPipedMetaRequest) -> Result<ReportPipedMetaResponse> {
        let meta = PipedMetadata {
            version: req.version,
            config: req.config,
            platform_providers: req
                .platform_providers
                .into_iter()
                .map(|p| PlatformProvider { name: p.name, kind: p.r#type })
                .collect(),
            repositories: req
                .repositories
                .into_iter()
                .map(|r| ApplicationGitRepository {
                    id: r.id,
                    remote: r.remote,
                    branch: r.branch,
                })
                .collect(),
            secret_encryption_public_key: req.secret_encryption_public_key,
            started_at: req.started_at,
        };
        let piped = self.pipeds.update_metadata(&id.piped_id, &meta).await?;
        Ok(ReportPipedMetaResponse {
            name: piped.name,
            web_base_url: self.config.spec.address.clone(),
        })
    }

    async fn list_applications(&self, id: PipedIdentity, _req: ListApplicationsRequest) -> Result<ListApplicationsResponse> {
        let apps: Vec<Application> = self
            .applications
            .list_by_piped(&id.piped_id)
            .await?
            .into_iter()
            .filter(|a| !a.disabled)
            .collect();
        Ok(ListApplicationsResponse {
            applications_json: to_json_all(&apps)?,
        })
    }

    async fn report_application_sync_state(
        &self,
        id: PipedIdentity,
        req: ReportApplicationSyncStateRequest,
    ) -> Result<ReportApplicationSyncStateResponse> {
        let state = req.state.ok_or_else(|| Error::invalid_argument("state is required"))?;
        self.application(&id, &req.application_id).await?;
        let state = ApplicationSyncState {
            status: parse_enum("state.status", &state.status)?,
            short_reason: state.short_reason,
            reason: state.reason,
            head_deployment_id: state.head_deployment_id,
            timestamp: state.timestamp,
        };
        self.applications.update_sync_state(&req.application_id, state).await?;
        Ok(ReportApplicationSyncStateResponse {})
    }

    async fn report_application_deploying_status(
        &self,
        id: PipedIdentity,
        req: ReportApplicationDeployingStatusRequest,
    ) -> Result<ReportApplicationDeployingStatusResponse> {
        self.application(&id, &req.application_id).await?;
        self.applications
            .update_deploying_status(&req.application_id, req.deploying)
            .await?;
        Ok(ReportApplicationDeployingStatusResponse {})
    }

    async fn report_unregistered_applications(
        &self,
        id: PipedIdentity,
        req: ReportUnregisteredApplicationConfigurationsRequest,
    ) -> Result<ReportUnregisteredApplicationConfigurationsResponse> {
        let apps = req
            .applications
            .into_iter()
            .map(|a| {
                Ok(ApplicationInfo {
                    kind: parse_enum("kind", &a.kind)?,
                    name: a.name,
                    labels: sorted(a.labels),
                    repo_id: a.repo_id,
                    path: a.path,
                    config_filename: a.config_filename,
                    piped_id: id.piped_id.clone(),
                    description: a.description,
                    ..Default::default()
                })
            })
            .collect::<Result<Vec<_>>>()?;
        self.unregistered_apps.put(&id.project_id, &id.piped_id, &apps).await?;
        Ok(ReportUnregisteredApplicationConfigurationsResponse {})
    }

    async fn list_unhandled_commands(
        &self,
        id: PipedIdentity,
        _req: ListUnhandledCommandsRequest,
    ) -> Result<ListUnhandledCommandsResponse> {
        let commands = self.commands.list_unhandled(&id.piped_id).await?;
        Ok(ListUnhandledCommandsResponse {
            commands_json: to_json_all(&commands)?,
        })
    }

    async fn report_command_handled(
        &self,
        id: PipedIdentity,
        req: ReportCommandHandledRequest,
    ) -> Result<ReportCommandHandledResponse> {
        let command = self.command(&id, &req.command_id).await?;
        let status = parse_enum("status", &req.status)?;
        if !req.output.is_empty() {
            self.command_outputs.put(&command.id, Bytes::from(req.output)).await?;
        }
        self.commands
            .update_handled(&command.id, status, &sorted(req.metadata), req.handled_at)
            .await?;
        Ok(ReportCommandHandledResponse {})
    }

    async fn create_deployment(&self, id: PipedIdentity, req: CreateDeploymentRequest) -> Result<CreateDeploymentResponse> {
        let deployment: Deployment = from_json("deployment_json", &req.deployment_json)?;
        if deployment.piped_id != id.piped_id || deployment.project_id != id.project_id {
            return Err(Error::permission_denied("deployment does not belong to the calling piped"));
        }
        let app = self.application(&id, &deployment.application_id).await?;
        let deployment = self.deployments.add(deployment).await?;
        self.applications
            .update_most_recent_deployment(
                &app.id,
                DeploymentStatus::DeploymentPending,
                deployment_reference(&deployment),
            )
            .await?;
        if deployment.is_in_chain() {
            self.chains
                .add_deployment_to_block(&deployment.deployment_chain_id, &deployment)
                .await?;
        }
        Ok(CreateDeploymentResponse {})
    }

    async fn report_deployment_planned(
        &self,
        id: PipedIdentity,
        req: ReportDeploymentPlannedRequest,
    ) -> Result<ReportDeploymentPlannedResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let stages: Option<Vec<PipelineStage>> = if req.stages_json.is_empty() {
            None
        } else {
            Some(from_json("stages_json", &req.stages_json)?)
        };
        self.deployments
            .update(&req.deployment_id, |d| {
                d.status = DeploymentStatus::DeploymentPlanned;
                d.summary.clone_from(&req.summary);
                d.status_reason.clone_from(&req.status_reason);
                d.running_commit_hash.clone_from(&req.running_commit_hash);
                d.running_config_filename.clone_from(&req.running_config_filename);
                d.version.clone_from(&req.version);
                if let Some(stages) = &stages {
                    d.stages.clone_from(stages);
                }
                Ok(())
            })
            .await?;
        Ok(ReportDeploymentPlannedResponse {})
    }

    async fn report_deployment_status_changed(
        &self,
        id: PipedIdentity,
        req: ReportDeploymentStatusChangedRequest,
    ) -> Result<ReportDeploymentStatusChangedResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let status = parse_enum("status", &req.status)?;
        self.deployments
            .update_status(&req.deployment_id, status, &req.status_reason)
            .await?;
        self.update_chain_node(
            &req.deployment_chain_id,
            req.deployment_chain_block_index,
            &req.deployment_id,
            status,
            &req.status_reason,
        )
        .await?;
        Ok(ReportDeploymentStatusChangedResponse {})
    }

    async fn report_deployment_completed(
        &self,
        id: PipedIdentity,
        req: ReportDeploymentCompletedRequest,
    ) -> Result<ReportDeploymentCompletedResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let status: DeploymentStatus = parse_enum("status", &req.status)?;
        if !status.is_completed() {
            return Err(Error::invalid_argument(format!("{} is not a completed status", req.status)));
        }
        let stage_statuses = req
            .stage_statuses
            .iter()
            .map(|(stage, s)| Ok((stage.clone(), parse_enum::<StageStatus>("stage_statuses", s)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let completed_at = if req.completed_at > 0 { req.completed_at } else { now_unix() };
        let deployment = self
            .deployments
            .update_completed(&req.deployment_id, status, &stage_statuses, &req.status_reason, completed_at)
            .await?;
        if status == DeploymentStatus::DeploymentSuccess {
            self.applications
                .update_most_recent_deployment(&deployment.application_id, status, deployment_reference(&deployment))
                .await?;
        }
        self.update_chain_node(
            &req.deployment_chain_id,
            req.deployment_chain_block_index,
            &req.deployment_id,
            status,
            &req.status_reason,
        )
        .await?;
        Ok(ReportDeploymentCompletedResponse {})
    }

    async fn report_stage_status_changed(
        &self,
        id: PipedIdentity,
        req: ReportStageStatusChangedRequest,
    ) -> Result<ReportStageStatusChangedResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let status = parse_enum("status", &req.status)?;
        self.deployments
            .update_stage_status(
                &req.deployment_id,
                &req.stage_id,
                status,
                &req.status_reason,
                req.retried_count,
                req.completed_at,
            )
            .await?;
        Ok(ReportStageStatusChangedResponse {})
    }

    async fn save_stage_metadata(&self, id: PipedIdentity, req: SaveStageMetadataRequest) -> Result<SaveStageMetadataResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        self.deployments
            .merge_stage_metadata(&req.deployment_id, &req.stage_id, &sorted(req.metadata))
            .await?;
        Ok(SaveStageMetadataResponse {})
    }

    /// A completed report carries the full log and replaces the stored one
    async fn report_stage_logs(&self, id: PipedIdentity, req: ReportStageLogsRequest) -> Result<ReportStageLogsResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let blocks = req
            .blocks
            .into_iter()
            .map(|b| {
                Ok(LogBlock {
                    index: b.index,
                    log: b.log,
                    severity: parse_enum("severity", &b.severity)?,
                    created_at: b.created_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if req.completed {
            self.stage_logs
                .append_logs_from_last_checkpoint(&req.deployment_id, &req.stage_id, req.retried_count, &blocks, true)
                .await?;
        } else {
            self.stage_logs
                .append_logs(&req.deployment_id, &req.stage_id, req.retried_count, &blocks)
                .await?;
        }
        Ok(ReportStageLogsResponse {})
    }

    async fn get_latest_analysis_result(
        &self,
        id: PipedIdentity,
        req: GetLatestAnalysisResultRequest,
    ) -> Result<GetLatestAnalysisResultResponse> {
        self.application(&id, &req.application_id).await?;
        let result = self.analysis.get_latest(&req.application_id).await?;
        Ok(GetLatestAnalysisResultResponse {
            start_time: result.start_time,
        })
    }

    async fn put_latest_analysis_result(
        &self,
        id: PipedIdentity,
        req: PutLatestAnalysisResultRequest,
    ) -> Result<PutLatestAnalysisResultResponse> {
        self.application(&id, &req.application_id).await?;
        let result = AnalysisResult {
            start_time: req.start_time,
        };
        self.analysis.put_latest(&req.application_id, &result).await?;
        Ok(PutLatestAnalysisResultResponse {})
    }

    async fn get_shared_object(
        &self,
        id: PipedIdentity,
        req: GetApplicationSharedObjectRequest,
    ) -> Result<GetApplicationSharedObjectResponse> {
        self.application(&id, &req.application_id).await?;
        let object = self
            .shared_objects
            .get(&req.application_id, &req.plugin_name, &req.key)
            .await?;
        Ok(GetApplicationSharedObjectResponse { object: object.to_vec() })
    }

    async fn put_shared_object(
        &self,
        id: PipedIdentity,
        req: PutApplicationSharedObjectRequest,
    ) -> Result<PutApplicationSharedObjectResponse> {
        self.application(&id, &req.application_id).await?;
        self.shared_objects
            .put(&req.application_id, &req.plugin_name, &req.key, Bytes::from(req.object))
            .await?;
        Ok(PutApplicationSharedObjectResponse {})
    }

    async fn report_plan_preview_output(
        &self,
        id: PipedIdentity,
        req: ReportPlanPreviewOutputRequest,
    ) -> Result<ReportPlanPreviewOutputResponse> {
        let command = self.command(&id, &req.command_id).await?;
        self.command_outputs.put(&command.id, Bytes::from(req.output)).await?;
        Ok(ReportPlanPreviewOutputResponse {})
    }
}

type Reply<T> = std::result::Result<Response<T>, Status>;

#[tonic::async_trait]
impl PipedService for PipedApi {
    async fn ping(&self, request: Request<PingRequest>) -> Reply<PingResponse> {
        self.endpoint.unary("Ping", request, |id, req| self.handler.ping(id, req)).await
    }

    async fn report_piped_meta(&self, request: Request<ReportPipedMetaRequest>) -> Reply<ReportPipedMetaResponse> {
        self.endpoint
            .unary("ReportPipedMeta", request, |id, req| self.handler.report_piped_meta(id, req))
            .await
    }

    async fn list_applications(&self, request: Request<ListApplicationsRequest>) -> Reply<ListApplicationsResponse> {
        self.endpoint
            .unary("ListApplications", request, |id, req| self.handler.list_applications(id, req))
            .await
    }

    async fn report_application_sync_state(
        &self,
        request: Request<ReportApplicationSyncStateRequest>,
    ) -> Reply<ReportApplicationSyncStateResponse> {
        self.endpoint
            .unary("ReportApplicationSyncState", request, |id, req| {
                self.handler.report_application_sync_state(id, req)
            })
            .await
    }

    async fn report_application_deploying_status(
        &self,
        request: Request<ReportApplicationDeployingStatusRequest>,
    ) -> Reply<ReportApplicationDeployingStatusResponse> {
        self.endpoint
            .unary("ReportApplicationDeployingStatus", request, |id, req| {
                self.handler.report_application_deploying_status(id, req)
            })
            .await
    }

    async fn report_unregistered_application_configurations(
        &self,
        request: Request<ReportUnregisteredApplicationConfigurationsRequest>,
    ) -> Reply<ReportUnregisteredApplicationConfigurationsResponse> {
        self.endpoint
            .unary("ReportUnregisteredApplicationConfigurations", request, |id, req| {
                self.handler.report_unregistered_applications(id, req)
            })
            .await
    }

    async fn list_unhandled_commands(
        &self,
        request: Request<ListUnhandledCommandsRequest>,
    ) -> Reply<ListUnhandledCommandsResponse> {
        self.endpoint
            .unary("ListUnhandledCommands", request, |id, req| self.handler.list_unhandled_commands(id, req))
            .await
    }

    async fn report_command_handled(
        &self,
        request: Request<ReportCommandHandledRequest>,
    ) -> Reply<ReportCommandHandledResponse> {
        self.endpoint
            .unary("ReportCommandHandled", request, |id, req| self.handler.report_command_handled(id, req))
            .await
    }

    async fn create_deployment(&self, request: Request<CreateDeploymentRequest>) -> Reply<CreateDeploymentResponse> {
        self.endpoint
            .unary("CreateDeployment", request, |id, req| self.handler.create_deployment(id, req))
            .await
    }

    async fn report_deployment_planned(
        &self,
        request: Request<ReportDeploymentPlannedRequest>,
    ) -> Reply<ReportDeploymentPlannedResponse> {
        self.endpoint
            .unary("ReportDeploymentPlanned", request, |id, req| self.handler.report_deployment_planned(id, req))
            .await
    }

    async fn report_deployment_status_changed(
        &self,
        request: Request<ReportDeploymentStatusChangedRequest>,
    ) -> Reply<ReportDeploymentStatusChangedResponse> {
        self.endpoint
            .unary("ReportDeploymentStatusChanged", request, |id, req| {
                self.handler.report_deployment_status_changed(id, req)
            })
            .await
    }

    async fn report_deployment_completed(
        &self,
        request: Request<ReportDeploymentCompletedRequest>,
    ) -> Reply<ReportDeploymentCompletedResponse> {
        self.endpoint
            .unary("ReportDeploymentCompleted", request, |id, req| {
                self.handler.report_deployment_completed(id, req)
            })
            .await
    }

    async fn report_stage_status_changed(
        &self,
        request: Request<ReportStageStatusChangedRequest>,
    ) -> Reply<ReportStageStatusChangedResponse> {
        self.endpoint
            .unary("ReportStageStatusChanged", request, |id, req| {
                self.handler.report_stage_status_changed(id, req)
            })
            .await
    }

    async fn save_stage_metadata(&self, request: Request<SaveStageMetadataRequest>) -> Reply<SaveStageMetadataResponse> {
        self.endpoint
            .unary("SaveStageMetadata", request, |id, req| self.handler.save_stage_metadata(id, req))
            .await
    }

    async fn report_stage_logs(&self, request: Request<ReportStageLogsRequest>) -> Reply<ReportStageLogsResponse> {
        self.endpoint
            .unary("ReportStageLogs", request, |id, req| self.handler.report_stage_logs(id, req))
            .await
    }

    async fn get_latest_analysis_result(
        &self,
        request: Request<GetLatestAnalysisResultRequest>,
    ) -> Reply<GetLatestAnalysisResultResponse> {
        self.endpoint
            .unary("GetLatestAnalysisResult", request, |id, req| {
                self.handler.get_latest_analysis_result(id, req)
            })
            .await
    }

    async fn put_latest_analysis_result(
        &self,
        request: Request<PutLatestAnalysisResultRequest>,
    ) -> Reply<PutLatestAnalysisResultResponse> {
        self.endpoint
            .unary("PutLatestAnalysisResult", request, |id, req| {
                self.handler.put_latest_analysis_result(id, req)
            })
            .await
    }

    async fn get_application_shared_object(
        &self,
        request: Request<GetApplicationSharedObjectRequest>,
    ) -> Reply<GetApplicationSharedObjectResponse> {
        self.endpoint
            .unary("GetApplicationSharedObject", request, |id, req| self.handler.get_shared_object(id, req))
            .await
    }

    async fn put_application_shared_object(
        &self,
        request: Request<PutApplicationSharedObjectRequest>,
    ) -> Reply<PutApplicationSharedObjectResponse> {
        self.endpoint
            .unary("PutApplicationSharedObject", request, |id, req| self.handler.put_shared_object(id, req))
            .await
    }

    async fn report_plan_preview_output(
        &self,
        request: Request<ReportPlanPreviewOutputRequest>,
    ) -> Reply<ReportPlanPreviewOutputResponse> {
        self.endpoint
            .unary("ReportPlanPreviewOutput", request, |id, req| {
                self.handler.report_plan_preview_output(id, req)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pipecd_common::model::{
        ChainApplicationRef, ChainBlock, ChainBlockStatus, ChainNode, CommandStatus, DeploymentChain, Piped,
        hash_id,
    };
    use pipecd_datastore::DataStore;
    use tonic::Code;
    use tonic::metadata::MetadataValue;

    const TOKEN: &str = "PIPED-TOKEN p,piped-1,secret";

    async fn setup() -> (PipedApi, Arc<dyn DataStore>, Deps) {
        let deps = testing::deps();
        let ds = deps.datastore.clone();
        let web_pipeds = PipedStore::new(ds.clone(), Commander::Web);
        for piped_id in ["piped-1", "piped-2"] {
            let mut piped = Piped {
                id: piped_id.into(),
                name: piped_id.into(),
                project_id: "p".into(),
                ..Default::default()
            };
            piped.add_key(hash_id(&["secret"]), "alice", 1).unwrap();
            web_pipeds.add(piped).await.unwrap();
        }
        let apps = ApplicationStore::new(ds.clone(), Commander::Web);
        for (app_id, piped_id) in [("app-1", "piped-1"), ("app-2", "piped-2")] {
            apps.add(Application {
                id: app_id.into(),
                name: app_id.into(),
                piped_id: piped_id.into(),
                project_id: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let auth = Arc::new(PipedTokenAuth::new(Arc::new(PipedStore::new(ds.clone(), Commander::Piped))));
        (PipedApi::new(&deps, auth), ds, deps)
    }

    fn request<T>(msg: T) -> Request<T> {
        let mut req = Request::new(msg);
        req.metadata_mut()
            .insert("authorization", MetadataValue::from_static(TOKEN));
        req
    }

    #[tokio::test]
    async fn test_rejects_missing_token() {
        let (api, _, _) = setup().await;
        let err = api
            .list_applications(Request::new(ListApplicationsRequest {}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unauthenticated);
    }

    #[tokio::test]
    async fn test_only_own_applications() {
        let (api, _, _) = setup().await;
        let resp = api
            .list_applications(request(ListApplicationsRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.applications_json.len(), 1);
        assert!(resp.applications_json[0].contains("app-1"));

        let err = api
            .report_application_deploying_status(request(ReportApplicationDeployingStatusRequest {
                application_id: "app-2".into(),
                deploying: true,
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_report_command_handled_stores_output() {
        let (api, ds, deps) = setup().await;
        let commands = CommandStore::new(ds, Commander::Web);
        commands
            .add(Command {
                id: "cmd-1".into(),
                piped_id: "piped-1".into(),
                project_id: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        api.report_command_handled(request(ReportCommandHandledRequest {
            command_id: "cmd-1".into(),
            status: "COMMAND_SUCCEEDED".into(),
            output: b"{\"ok\":true}".to_vec(),
            handled_at: 42,
            ..Default::default()
        }))
        .await
        .unwrap();

        let handled = commands.get("cmd-1").await.unwrap();
        assert_eq!(handled.status, CommandStatus::CommandSucceeded);
        assert_eq!(handled.handled_at, 42);
        let output = CommandOutputStore::new(deps.filestore).get("cmd-1").await.unwrap();
        assert_eq!(&output[..], b"{\"ok\":true}");

        let err = api
            .report_command_handled(request(ReportCommandHandledRequest {
                command_id: "cmd-1".into(),
                status: "COMMAND_FAILED".into(),
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_deployment_lifecycle_updates_chain() {
        let (api, ds, _) = setup().await;
        let node = |app: &str| ChainNode {
            application_ref: ChainApplicationRef {
                application_id: app.into(),
                application_name: app.into(),
            },
            deployment_ref: None,
        };
        let chains = DeploymentChainStore::new(ds.clone(), Commander::Web);
        chains
            .add(DeploymentChain {
                id: "chain".into(),
                project_id: "p".into(),
                blocks: vec![
                    ChainBlock {
                        nodes: vec![node("app-0")],
                        status: ChainBlockStatus::DeploymentBlockSuccess,
                        ..Default::default()
                    },
                    ChainBlock {
                        nodes: vec![node("app-1")],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            })
            .await
            .unwrap();

        let deployment = Deployment {
            id: "d1".into(),
            application_id: "app-1".into(),
            piped_id: "piped-1".into(),
            project_id: "p".into(),
            deployment_chain_id: "chain".into(),
            deployment_chain_block_index: 1,
            ..Default::default()
        };
        api.create_deployment(request(CreateDeploymentRequest {
            deployment_json: serde_json::to_string(&deployment).unwrap(),
        }))
        .await
        .unwrap();

        let app = ApplicationStore::new(ds.clone(), Commander::Web).get("app-1").await.unwrap();
        assert_eq!(app.most_recently_triggered_deployment.unwrap().deployment_id, "d1");
        let chain = chains.get("chain").await.unwrap();
        assert_eq!(chain.blocks[1].status, ChainBlockStatus::DeploymentBlockRunning);

        api.report_deployment_completed(request(ReportDeploymentCompletedRequest {
            deployment_id: "d1".into(),
            status: "DEPLOYMENT_SUCCESS".into(),
            completed_at: 100,
            deployment_chain_id: "chain".into(),
            deployment_chain_block_index: 1,
            ..Default::default()
        }))
        .await
        .unwrap();

        let d = DeploymentStore::new(ds.clone(), Commander::Piped).get("d1").await.unwrap();
        assert_eq!(d.status, DeploymentStatus::DeploymentSuccess);
        assert_eq!(d.completed_at, 100);
        let app = ApplicationStore::new(ds.clone(), Commander::Web).get("app-1").await.unwrap();
        assert_eq!(app.most_recently_successful_deployment.unwrap().deployment_id, "d1");
        let chain = chains.get("chain").await.unwrap();
        assert_eq!(chain.blocks[1].status, ChainBlockStatus::DeploymentBlockSuccess);
        assert!(chain.is_completed());

        let err = api
            .create_deployment(request(CreateDeploymentRequest {
                deployment_json: serde_json::to_string(&Deployment {
                    id: "d2".into(),
                    application_id: "app-2".into(),
                    piped_id: "piped-1".into(),
                    project_id: "p".into(),
                    ..Default::default()
                })
                .unwrap(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_ping_records_stat() {
        let (api, _, deps) = setup().await;
        api.ping(request(PingRequest { stat: None })).await.unwrap();
        let stat = deps.piped_stats.get("piped-1").await.unwrap();
        assert!(stat.timestamp > 0);
    }
}
