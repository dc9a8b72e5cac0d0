//! Console-facing API
//!
//! Callers are authenticated by JWT and checked against the project RBAC
//! roles before a handler runs. Handlers only ever touch entities of the
//! caller's project.

use super::{Deps, Endpoint, parse_enum, require_fields, sorted, to_json, to_json_all};
use crate::auth::{WebAuth, WebIdentity};
use crate::encryption::Encrypter;
use pipecd_common::model::{
    ApiKey, ApiKeyRole, Application, ApplicationGitPath, ApplicationKind, ApplicationSyncStatus, Command,
    CommandType, Deployment, DeploymentStatus, InsightMetricsKind, InsightStep, Piped, hash_id, now_unix,
};
use pipecd_common::{Error, Result};
use pipecd_datastore::{
    ApiKeyStore, ApplicationStore, CommandStore, Commander, DeploymentStore, ListOptions, Operator, Order, PipedStore,
};
use pipecd_proto::webservice::web_service_server::{WebService, WebServiceServer};
use pipecd_proto::webservice::{
    AddApplicationRequest, AddApplicationResponse, CancelDeploymentRequest, CancelDeploymentResponse,
    DeleteApplicationRequest, DeleteApplicationResponse, DeleteOldPipedKeysRequest, DeleteOldPipedKeysResponse,
    DisableApiKeyRequest, DisableApiKeyResponse, DisableApplicationRequest, DisableApplicationResponse,
    DisablePipedRequest, DisablePipedResponse, EnableApplicationRequest, EnableApplicationResponse,
    EnablePipedRequest, EnablePipedResponse, EncryptSecretRequest, EncryptSecretResponse, GenerateApiKeyRequest,
    GenerateApiKeyResponse, GetApplicationRequest, GetApplicationResponse, GetCommandRequest, GetCommandResponse,
    GetDeploymentRequest, GetDeploymentResponse, GetInsightDataRequest, GetInsightDataResponse, GetMeRequest,
    GetMeResponse, GetStageLogRequest, GetStageLogResponse, ListApiKeysRequest, ListApiKeysResponse,
    ListApplicationsRequest, ListApplicationsResponse, ListDeploymentsRequest, ListDeploymentsResponse,
    ListPipedsRequest, ListPipedsResponse, ListUnregisteredApplicationsRequest,
    ListUnregisteredApplicationsResponse, RecreatePipedKeyRequest, RecreatePipedKeyResponse, RegisterPipedRequest,
    RegisterPipedResponse, SkipStageRequest, SkipStageResponse, SyncApplicationRequest, SyncApplicationResponse,
};
use pipecd_stores::{InsightStore, PipedStatStore, StageLogStore, UnregisteredAppStore};
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

/// A piped whose last stat is older than this is reported offline
const PIPED_ONLINE_WINDOW_SECS: i64 = 120;
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;
const KEY_SECRET_LEN: usize = 50;

require_fields! {
    RegisterPipedRequest => [name];
    ListPipedsRequest => [];
    RecreatePipedKeyRequest => [id];
    DeleteOldPipedKeysRequest => [piped_id];
    EnablePipedRequest => [piped_id];
    DisablePipedRequest => [piped_id];
    AddApplicationRequest => [name, piped_id, kind, repo_id, path];
    GetApplicationRequest => [application_id];
    ListApplicationsRequest => [];
    SyncApplicationRequest => [application_id];
    EnableApplicationRequest => [application_id];
    DisableApplicationRequest => [application_id];
    DeleteApplicationRequest => [application_id];
    ListUnregisteredApplicationsRequest => [];
    ListDeploymentsRequest => [];
    GetDeploymentRequest => [deployment_id];
    CancelDeploymentRequest => [deployment_id];
    SkipStageRequest => [deployment_id, stage_id];
    GetStageLogRequest => [deployment_id, stage_id];
    GetCommandRequest => [command_id];
    GenerateApiKeyRequest => [name, role];
    ListApiKeysRequest => [];
    DisableApiKeyRequest => [id];
    EncryptSecretRequest => [piped_id, data];
    GetInsightDataRequest => [metrics_kind];
    GetMeRequest => [];
}

fn random_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(KEY_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn ensure_project(id: &WebIdentity, project_id: &str, what: &str) -> Result<()> {
    if project_id != id.project_id {
        return Err(Error::permission_denied(format!(
            "requested {what} does not belong to project {}",
            id.project_id
        )));
    }
    Ok(())
}

pub struct WebApi {
    endpoint: Endpoint<WebAuth>,
    handler: Handler,
}

impl WebApi {
    pub fn new(deps: &Deps, auth: Arc<WebAuth>) -> Self {
        Self {
            endpoint: Endpoint::new("WebService", auth),
            handler: Handler::new(deps),
        }
    }

    pub fn into_server(self) -> WebServiceServer<Self> {
        WebServiceServer::new(self)
    }
}

struct Handler {
    pipeds: PipedStore,
    applications: ApplicationStore,
    deployments: DeploymentStore,
    commands: CommandStore,
    api_keys: ApiKeyStore,
    stage_logs: StageLogStore,
    insights: InsightStore,
    piped_stats: Arc<PipedStatStore>,
    unregistered_apps: Arc<UnregisteredAppStore>,
    encrypter: Arc<Encrypter>,
}

impl Handler {
    fn new(deps: &Deps) -> Self {
        let ds = &deps.datastore;
        Self {
            pipeds: PipedStore::new(ds.clone(), Commander::Web),
            applications: ApplicationStore::new(ds.clone(), Commander::Web),
            deployments: DeploymentStore::new(ds.clone(), Commander::Web),
            commands: CommandStore::new(ds.clone(), Commander::Web),
            api_keys: ApiKeyStore::new(ds.clone(), Commander::Web),
            stage_logs: StageLogStore::new(deps.filestore.clone(), deps.cache.clone()),
            insights: InsightStore::new(deps.filestore.clone()),
            piped_stats: deps.piped_stats.clone(),
            unregistered_apps: deps.unregistered_apps.clone(),
            encrypter: deps.encrypter.clone(),
        }
    }

    async fn piped(&self, id: &WebIdentity, piped_id: &str) -> Result<Piped> {
        let piped = self.pipeds.get(piped_id).await?;
        ensure_project(id, &piped.project_id, "piped")?;
        Ok(piped)
    }

    async fn application(&self, id: &WebIdentity, application_id: &str) -> Result<Application> {
        let app = self.applications.get(application_id).await?;
        ensure_project(id, &app.project_id, "application")?;
        Ok(app)
    }

    async fn deployment(&self, id: &WebIdentity, deployment_id: &str) -> Result<Deployment> {
        let d = self.deployments.get(deployment_id).await?;
        ensure_project(id, &d.project_id, "deployment")?;
        Ok(d)
    }

    async fn add_command(&self, command: Command) -> Result<String> {
        let command = self.commands.add(command).await?;
        Ok(command.id)
    }

    fn new_command(id: &WebIdentity, kind: CommandType, piped_id: &str, application_id: &str) -> Command {
        Command {
            id: Uuid::new_v4().to_string(),
            piped_id: piped_id.to_string(),
            application_id: application_id.to_string(),
            project_id: id.project_id.clone(),
            commander: id.subject.clone(),
            kind,
            created_at: now_unix(),
            ..Default::default()
        }
    }

    async fn register_piped(&self, id: WebIdentity, req: RegisterPipedRequest) -> Result<RegisterPipedResponse> {
        let key = random_secret();
        let now = now_unix();
        let mut piped = Piped {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            desc: req.desc,
            project_id: id.project_id,
            ..Default::default()
        };
        piped.add_key(hash_id(&[&key]), id.subject, now)?;
        let piped = self.pipeds.add(piped).await?;
        Ok(RegisterPipedResponse { id: piped.id, key })
    }

    async fn list_pipeds(&self, id: WebIdentity, req: ListPipedsRequest) -> Result<ListPipedsResponse> {
        let opts = ListOptions::default()
            .filter("ProjectId", Operator::Equal, id.project_id.as_str())
            .order(Order::asc("CreatedAt"));
        let mut pipeds = self.pipeds.list_all(&opts).await?;
        for piped in &mut pipeds {
            for key in &mut piped.keys {
                key.hash.clear();
            }
        }

        let mut online_piped_ids = Vec::new();
        if req.with_status {
            let now = now_unix();
            let stats = self.piped_stats.list().await?;
            online_piped_ids = pipeds
                .iter()
                .filter(|p| {
                    stats
                        .iter()
                        .any(|s| s.piped_id == p.id && !s.is_stale(now, PIPED_ONLINE_WINDOW_SECS))
                })
                .map(|p| p.id.clone())
                .collect();
        }
        Ok(ListPipedsResponse {
            pipeds_json: to_json_all(&pipeds)?,
            online_piped_ids,
        })
    }

    async fn recreate_piped_key(&self, id: WebIdentity, req: RecreatePipedKeyRequest) -> Result<RecreatePipedKeyResponse> {
        self.piped(&id, &req.id).await?;
        let key = random_secret();
        self.pipeds.add_key(&req.id, &hash_id(&[&key]), &id.subject).await?;
        Ok(RecreatePipedKeyResponse { key })
    }

    async fn delete_old_piped_keys(
        &self,
        id: WebIdentity,
        req: DeleteOldPipedKeysRequest,
    ) -> Result<DeleteOldPipedKeysResponse> {
        self.piped(&id, &req.piped_id).await?;
        self.pipeds.delete_old_keys(&req.piped_id).await?;
        Ok(DeleteOldPipedKeysResponse {})
    }

    async fn enable_piped(&self, id: WebIdentity, req: EnablePipedRequest) -> Result<EnablePipedResponse> {
        self.piped(&id, &req.piped_id).await?;
        self.pipeds.enable(&req.piped_id).await?;
        Ok(EnablePipedResponse {})
    }

    async fn disable_piped(&self, id: WebIdentity, req: DisablePipedRequest) -> Result<DisablePipedResponse> {
        self.piped(&id, &req.piped_id).await?;
        self.pipeds.disable(&req.piped_id).await?;
        Ok(DisablePipedResponse {})
    }

    async fn add_application(&self, id: WebIdentity, req: AddApplicationRequest) -> Result<AddApplicationResponse> {
        let piped = self.piped(&id, &req.piped_id).await?;
        let kind: ApplicationKind = parse_enum("kind", &req.kind)?;
        let repo = piped
            .repositories
            .iter()
            .find(|r| r.id == req.repo_id)
            .cloned()
            .ok_or_else(|| {
                Error::invalid_argument(format!("repository {} is not configured in piped {}", req.repo_id, piped.id))
            })?;
        let app = Application {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            piped_id: piped.id,
            project_id: id.project_id,
            kind,
            git_path: ApplicationGitPath {
                repo,
                path: req.path,
                config_filename: req.config_filename,
                ..Default::default()
            },
            platform_provider: req.platform_provider,
            description: req.description,
            labels: sorted(req.labels),
            ..Default::default()
        };
        let app = self.applications.add(app).await?;
        Ok(AddApplicationResponse { application_id: app.id })
    }

    async fn get_application(&self, id: WebIdentity, req: GetApplicationRequest) -> Result<GetApplicationResponse> {
        let app = self.application(&id, &req.application_id).await?;
        Ok(GetApplicationResponse {
            application_json: to_json(&app)?,
        })
    }

    async fn list_applications(&self, id: WebIdentity, req: ListApplicationsRequest) -> Result<ListApplicationsResponse> {
        let mut opts = ListOptions::default()
            .filter("ProjectId", Operator::Equal, id.project_id.as_str())
            .filter("Deleted", Operator::Equal, false)
            .order(Order::asc("Name"));
        if !req.kind.is_empty() {
            let kind: ApplicationKind = parse_enum("kind", &req.kind)?;
            opts = opts.filter("Kind", Operator::Equal, serde_json::to_value(kind)?);
        }
        if !req.piped_id.is_empty() {
            opts = opts.filter("PipedId", Operator::Equal, req.piped_id.as_str());
        }
        if !req.include_disabled {
            opts = opts.filter("Disabled", Operator::Equal, false);
        }
        let sync_status: Option<ApplicationSyncStatus> = if req.sync_status.is_empty() {
            None
        } else {
            Some(parse_enum("sync_status", &req.sync_status)?)
        };

        // Sync state and labels are nested, which the datastore can not filter on
        let apps: Vec<Application> = self
            .applications
            .list_all(&opts)
            .await?
            .into_iter()
            .filter(|a| {
                sync_status.is_none_or(|want| a.sync_state.as_ref().map(|s| s.status).unwrap_or_default() == want)
            })
            .filter(|a| req.labels.iter().all(|(k, v)| a.labels.get(k) == Some(v)))
            .collect();
        Ok(ListApplicationsResponse {
            applications_json: to_json_all(&apps)?,
        })
    }

    async fn sync_application(&self, id: WebIdentity, req: SyncApplicationRequest) -> Result<SyncApplicationResponse> {
        let app = self.application(&id, &req.application_id).await?;
        if app.disabled {
            return Err(Error::invalid_argument(format!("application {} is disabled", app.id)));
        }
        let mut command = Self::new_command(&id, CommandType::SyncApplication, &app.piped_id, &app.id);
        command.payload = json!({ "applicationId": app.id, "syncStrategy": "AUTO" });
        let command_id = self.add_command(command).await?;
        Ok(SyncApplicationResponse { command_id })
    }

    async fn enable_application(
        &self,
        id: WebIdentity,
        req: EnableApplicationRequest,
    ) -> Result<EnableApplicationResponse> {
        self.application(&id, &req.application_id).await?;
        self.applications.enable(&req.application_id).await?;
        Ok(EnableApplicationResponse {})
    }

    async fn disable_application(
        &self,
        id: WebIdentity,
        req: DisableApplicationRequest,
    ) -> Result<DisableApplicationResponse> {
        self.application(&id, &req.application_id).await?;
        self.applications.disable(&req.application_id).await?;
        Ok(DisableApplicationResponse {})
    }

    async fn delete_application(
        &self,
        id: WebIdentity,
        req: DeleteApplicationRequest,
    ) -> Result<DeleteApplicationResponse> {
        self.application(&id, &req.application_id).await?;
        self.applications.delete(&req.application_id).await?;
        Ok(DeleteApplicationResponse {})
    }

    async fn list_unregistered_applications(
        &self,
        id: WebIdentity,
        _req: ListUnregisteredApplicationsRequest,
    ) -> Result<ListUnregisteredApplicationsResponse> {
        let apps = self.unregistered_apps.list(&id.project_id).await?;
        Ok(ListUnregisteredApplicationsResponse {
            applications_json: to_json_all(&apps)?,
        })
    }

    async fn list_deployments(&self, id: WebIdentity, req: ListDeploymentsRequest) -> Result<ListDeploymentsResponse> {
        let mut opts = ListOptions::default().filter("ProjectId", Operator::Equal, id.project_id.as_str());
        if !req.statuses.is_empty() {
            let statuses = req
                .statuses
                .iter()
                .map(|s| {
                    let status: DeploymentStatus = parse_enum("statuses", s)?;
                    Ok(serde_json::Value::from(status.as_str()))
                })
                .collect::<Result<Vec<_>>>()?;
            opts = opts.filter("Status", Operator::In, statuses);
        }
        if !req.application_id.is_empty() {
            opts = opts.filter("ApplicationId", Operator::Equal, req.application_id.as_str());
        }
        if !req.kind.is_empty() {
            let kind: ApplicationKind = parse_enum("kind", &req.kind)?;
            opts = opts.filter("Kind", Operator::Equal, serde_json::to_value(kind)?);
        }
        let page_size = match usize::try_from(req.page_size) {
            Ok(0) | Err(_) => DEFAULT_PAGE_SIZE,
            Ok(n) => n.min(MAX_PAGE_SIZE),
        };
        let mut opts = opts.order(Order::desc("CreatedAt")).order(Order::asc("Id")).limit(page_size);
        opts.cursor = req.cursor;

        let (deployments, cursor) = self.deployments.list(&opts).await?;
        Ok(ListDeploymentsResponse {
            deployments_json: to_json_all(&deployments)?,
            cursor,
        })
    }

    async fn get_deployment(&self, id: WebIdentity, req: GetDeploymentRequest) -> Result<GetDeploymentResponse> {
        let d = self.deployment(&id, &req.deployment_id).await?;
        Ok(GetDeploymentResponse {
            deployment_json: to_json(&d)?,
        })
    }

    async fn cancel_deployment(&self, id: WebIdentity, req: CancelDeploymentRequest) -> Result<CancelDeploymentResponse> {
        let d = self.deployment(&id, &req.deployment_id).await?;
        if d.status.is_completed() {
            return Err(Error::invalid_argument(format!("deployment {} was already completed", d.id)));
        }
        let mut command = Self::new_command(&id, CommandType::CancelDeployment, &d.piped_id, &d.application_id);
        command.deployment_id = d.id;
        command.payload = json!({
            "forceRollback": req.force_rollback,
            "forceNoRollback": req.force_no_rollback,
        });
        let command_id = self.add_command(command).await?;
        Ok(CancelDeploymentResponse { command_id })
    }

    async fn skip_stage(&self, id: WebIdentity, req: SkipStageRequest) -> Result<SkipStageResponse> {
        let d = self.deployment(&id, &req.deployment_id).await?;
        let stage = d
            .stage(&req.stage_id)
            .ok_or_else(|| Error::not_found(format!("stage {} of deployment {}", req.stage_id, d.id)))?;
        if stage.status.is_completed() {
            return Err(Error::invalid_argument(format!("stage {} was already completed", stage.id)));
        }
        let mut command = Self::new_command(&id, CommandType::SkipStage, &d.piped_id, &d.application_id);
        command.deployment_id = d.id.clone();
        command.stage_id = req.stage_id;
        let command_id = self.add_command(command).await?;
        Ok(SkipStageResponse { command_id })
    }

    async fn get_stage_log(&self, id: WebIdentity, req: GetStageLogRequest) -> Result<GetStageLogResponse> {
        self.deployment(&id, &req.deployment_id).await?;
        let (blocks, completed) = self
            .stage_logs
            .fetch_logs(&req.deployment_id, &req.stage_id, req.retried_count, req.offset_index)
            .await?;
        Ok(GetStageLogResponse {
            blocks_json: to_json(&blocks)?,
            completed,
        })
    }

    async fn get_command(&self, id: WebIdentity, req: GetCommandRequest) -> Result<GetCommandResponse> {
        let command = self.commands.get(&req.command_id).await?;
        ensure_project(&id, &command.project_id, "command")?;
        Ok(GetCommandResponse {
            command_json: to_json(&command)?,
        })
    }

    async fn generate_api_key(&self, id: WebIdentity, req: GenerateApiKeyRequest) -> Result<GenerateApiKeyResponse> {
        let role: ApiKeyRole = parse_enum("role", &req.role)?;
        let key_id = Uuid::new_v4().to_string();
        let key = format!("{key_id}.{}", random_secret());
        let mut api_key = ApiKey {
            id: key_id,
            name: req.name,
            project_id: id.project_id,
            role,
            creator: id.subject,
            ..Default::default()
        };
        api_key.set_key_hash(&key);
        self.api_keys.add(api_key).await?;
        Ok(GenerateApiKeyResponse { key })
    }

    async fn list_api_keys(&self, id: WebIdentity, req: ListApiKeysRequest) -> Result<ListApiKeysResponse> {
        let mut opts = ListOptions::default()
            .filter("ProjectId", Operator::Equal, id.project_id.as_str())
            .order(Order::asc("CreatedAt"));
        if !req.include_disabled {
            opts = opts.filter("Disabled", Operator::Equal, false);
        }
        let mut keys = self.api_keys.list_all(&opts).await?;
        for key in &mut keys {
            key.key_hash.clear();
        }
        Ok(ListApiKeysResponse {
            keys_json: to_json_all(&keys)?,
        })
    }

    async fn disable_api_key(&self, id: WebIdentity, req: DisableApiKeyRequest) -> Result<DisableApiKeyResponse> {
        self.api_keys.disable(&req.id, &id.project_id).await?;
        Ok(DisableApiKeyResponse {})
    }

    async fn encrypt_secret(&self, id: WebIdentity, req: EncryptSecretRequest) -> Result<EncryptSecretResponse> {
        self.piped(&id, &req.piped_id).await?;
        let ciphertext = self.encrypter.encrypt(&req.data)?;
        Ok(EncryptSecretResponse { ciphertext })
    }

    async fn get_insight_data(&self, id: WebIdentity, req: GetInsightDataRequest) -> Result<GetInsightDataResponse> {
        let kind: InsightMetricsKind = parse_enum("metrics_kind", &req.metrics_kind)?;
        if !req.application_id.is_empty() {
            self.application(&id, &req.application_id).await?;
        }
        let points = self
            .insights
            .list_data_points(
                &id.project_id,
                &req.application_id,
                kind,
                InsightStep::Daily,
                req.range_from,
                req.range_to,
            )
            .await?;
        Ok(GetInsightDataResponse {
            data_points_json: to_json(&points)?,
            updated_at: now_unix(),
        })
    }

    #[allow(clippy::unused_async)]
    async fn get_me(&self, id: WebIdentity, _req: GetMeRequest) -> Result<GetMeResponse> {
        Ok(GetMeResponse {
            subject: id.subject,
            project_id: id.project_id,
            role: id.roles.join(","),
        })
    }
}

type Reply<T> = std::result::Result<Response<T>, Status>;

/// Delegates every RPC to the handler method of the same name
macro_rules! web_methods {
    ($($method:ident($req:ty) -> $resp:ty = $name:literal;)*) => {
        #[tonic::async_trait]
        impl WebService for WebApi {
            $(
                async fn $method(&self, request: Request<$req>) -> Reply<$resp> {
                    self.endpoint
                        .unary($name, request, |id, req| self.handler.$method(id, req))
                        .await
                }
            )*
        }
    };
}

web_methods! {
    register_piped(RegisterPipedRequest) -> RegisterPipedResponse = "RegisterPiped";
    list_pipeds(ListPipedsRequest) -> ListPipedsResponse = "ListPipeds";
    recreate_piped_key(RecreatePipedKeyRequest) -> RecreatePipedKeyResponse = "RecreatePipedKey";
    delete_old_piped_keys(DeleteOldPipedKeysRequest) -> DeleteOldPipedKeysResponse = "DeleteOldPipedKeys";
    enable_piped(EnablePipedRequest) -> EnablePipedResponse = "EnablePiped";
    disable_piped(DisablePipedRequest) -> DisablePipedResponse = "DisablePiped";
    add_application(AddApplicationRequest) -> AddApplicationResponse = "AddApplication";
    get_application(GetApplicationRequest) -> GetApplicationResponse = "GetApplication";
    list_applications(ListApplicationsRequest) -> ListApplicationsResponse = "ListApplications";
    sync_application(SyncApplicationRequest) -> SyncApplicationResponse = "SyncApplication";
    enable_application(EnableApplicationRequest) -> EnableApplicationResponse = "EnableApplication";
    disable_application(DisableApplicationRequest) -> DisableApplicationResponse = "DisableApplication";
    delete_application(DeleteApplicationRequest) -> DeleteApplicationResponse = "DeleteApplication";
    list_unregistered_applications(ListUnregisteredApplicationsRequest) -> ListUnregisteredApplicationsResponse
        = "ListUnregisteredApplications";
    list_deployments(ListDeploymentsRequest) -> ListDeploymentsResponse = "ListDeployments";
    get_deployment(GetDeploymentRequest) -> GetDeploymentResponse = "GetDeployment";
    cancel_deployment(CancelDeploymentRequest) -> CancelDeploymentResponse = "CancelDeployment";
    skip_stage(SkipStageRequest) -> SkipStageResponse = "SkipStage";
    get_stage_log(GetStageLogRequest) -> GetStageLogResponse = "GetStageLog";
    get_command(GetCommandRequest) -> GetCommandResponse = "GetCommand";
    generate_api_key(GenerateApiKeyRequest) -> GenerateApiKeyResponse = "GenerateAPIKey";
    list_api_keys(ListApiKeysRequest) -> ListApiKeysResponse = "ListAPIKeys";
    disable_api_key(DisableApiKeyRequest) -> DisableApiKeyResponse = "DisableAPIKey";
    encrypt_secret(EncryptSecretRequest) -> EncryptSecretResponse = "EncryptSecret";
    get_insight_data(GetInsightDataRequest) -> GetInsightDataResponse = "GetInsightData";
    get_me(GetMeRequest) -> GetMeResponse = "GetMe";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::{COOKIE_NAME, Claims, Role};
    use crate::testing;
    use pipecd_common::model::{ApplicationGitRepository, PipelineStage, ROLE_ADMIN, ROLE_VIEWER};
    use std::time::Duration;
    use tonic::Code;
    use tonic::metadata::MetadataValue;

    struct Fixture {
        api: WebApi,
        deps: Deps,
    }

    impl Fixture {
        async fn new() -> Self {
            let deps = testing::deps();
            let api = WebApi::new(&deps, Arc::new(WebAuth::new(deps.jwt.clone())));
            let pipeds = PipedStore::new(deps.datastore.clone(), Commander::Web);
            for (piped_id, project) in [("piped-1", "p"), ("piped-x", "other")] {
                pipeds
                    .add(Piped {
                        id: piped_id.into(),
                        name: piped_id.into(),
                        project_id: project.into(),
                        repositories: vec![ApplicationGitRepository {
                            id: "repo".into(),
                            remote: "git@github.com:org/repo.git".into(),
                            branch: "main".into(),
                        }],
                        ..Default::default()
                    })
                    .await
                    .unwrap();
            }
            Self { api, deps }
        }

        fn request<T>(&self, role: &str, msg: T) -> Request<T> {
            let claims = Claims::new(
                "alice",
                Role {
                    project_id: "p".into(),
                    project_rbac_roles: vec![role.into()],
                },
                now_unix(),
                Duration::from_secs(600),
            );
            let token = self.deps.jwt.sign(&claims).unwrap();
            let mut req = Request::new(msg);
            req.metadata_mut().insert(
                "cookie",
                MetadataValue::try_from(format!("{COOKIE_NAME}={token}")).unwrap(),
            );
            req
        }

        async fn add_app(&self, name: &str) -> String {
            self.api
                .add_application(self.request(
                    ROLE_ADMIN,
                    AddApplicationRequest {
                        name: name.into(),
                        piped_id: "piped-1".into(),
                        kind: "ECS".into(),
                        repo_id: "repo".into(),
                        path: format!("apps/{name}"),
                        ..Default::default()
                    },
                ))
                .await
                .unwrap()
                .into_inner()
                .application_id
        }
    }

    #[tokio::test]
    async fn test_register_piped_returns_usable_key() {
        let f = Fixture::new().await;
        let resp = f
            .api
            .register_piped(f.request(
                ROLE_ADMIN,
                RegisterPipedRequest {
                    name: "dev".into(),
                    desc: String::new(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.key.len(), KEY_SECRET_LEN);

        let piped = PipedStore::new(f.deps.datastore.clone(), Commander::Web)
            .get(&resp.id)
            .await
            .unwrap();
        piped.check_key(&resp.key).unwrap();

        let list = f
            .api
            .list_pipeds(f.request(ROLE_VIEWER, ListPipedsRequest { with_status: false }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.pipeds_json.len(), 2);
        assert!(list.pipeds_json.iter().all(|p| !p.contains(&hash_id(&[&resp.key]))));
    }

    #[tokio::test]
    async fn test_viewer_can_not_register_piped() {
        let f = Fixture::new().await;
        let err = f
            .api
            .register_piped(f.request(
                ROLE_VIEWER,
                RegisterPipedRequest {
                    name: "dev".into(),
                    desc: String::new(),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_add_application_requires_known_repository() {
        let f = Fixture::new().await;
        let err = f
            .api
            .add_application(f.request(
                ROLE_ADMIN,
                AddApplicationRequest {
                    name: "app".into(),
                    piped_id: "piped-1".into(),
                    kind: "ECS".into(),
                    repo_id: "missing".into(),
                    path: "apps/app".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = f
            .api
            .add_application(f.request(
                ROLE_ADMIN,
                AddApplicationRequest {
                    name: "app".into(),
                    piped_id: "piped-x".into(),
                    kind: "ECS".into(),
                    repo_id: "repo".into(),
                    path: "apps/app".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_sync_and_list_applications() {
        let f = Fixture::new().await;
        let a = f.add_app("a").await;
        let b = f.add_app("b").await;
        f.api
            .disable_application(f.request(
                ROLE_ADMIN,
                DisableApplicationRequest {
                    application_id: b.clone(),
                },
            ))
            .await
            .unwrap();

        let list = f
            .api
            .list_applications(f.request(ROLE_VIEWER, ListApplicationsRequest::default()))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(list.applications_json.len(), 1);
        assert!(list.applications_json[0].contains(&a));

        let command_id = f
            .api
            .sync_application(f.request(
                ROLE_ADMIN,
                SyncApplicationRequest {
                    application_id: a.clone(),
                },
            ))
            .await
            .unwrap()
            .into_inner()
            .command_id;
        let command = CommandStore::new(f.deps.datastore.clone(), Commander::Web)
            .get(&command_id)
            .await
            .unwrap();
        assert_eq!(command.kind, CommandType::SyncApplication);
        assert_eq!(command.piped_id, "piped-1");
        assert_eq!(command.commander, "alice");

        let err = f
            .api
            .sync_application(f.request(ROLE_ADMIN, SyncApplicationRequest { application_id: b }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_cancel_and_skip() {
        let f = Fixture::new().await;
        let deployments = DeploymentStore::new(f.deps.datastore.clone(), Commander::Piped);
        for (id, status) in [
            ("running", DeploymentStatus::DeploymentRunning),
            ("done", DeploymentStatus::DeploymentSuccess),
        ] {
            deployments
                .add(Deployment {
                    id: id.into(),
                    application_id: "app".into(),
                    piped_id: "piped-1".into(),
                    project_id: "p".into(),
                    status,
                    stages: vec![PipelineStage {
                        id: "wait".into(),
                        ..Default::default()
                    }],
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        f.api
            .cancel_deployment(f.request(
                ROLE_ADMIN,
                CancelDeploymentRequest {
                    deployment_id: "running".into(),
                    force_rollback: true,
                    force_no_rollback: false,
                },
            ))
            .await
            .unwrap();
        let err = f
            .api
            .cancel_deployment(f.request(
                ROLE_ADMIN,
                CancelDeploymentRequest {
                    deployment_id: "done".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let resp = f
            .api
            .skip_stage(f.request(
                ROLE_ADMIN,
                SkipStageRequest {
                    deployment_id: "running".into(),
                    stage_id: "wait".into(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        let command = CommandStore::new(f.deps.datastore.clone(), Commander::Web)
            .get(&resp.command_id)
            .await
            .unwrap();
        assert_eq!(command.kind, CommandType::SkipStage);
        assert_eq!(command.stage_id, "wait");
    }

    #[tokio::test]
    async fn test_api_key_lifecycle() {
        let f = Fixture::new().await;
        let key = f
            .api
            .generate_api_key(f.request(
                ROLE_ADMIN,
                GenerateApiKeyRequest {
                    name: "ci".into(),
                    role: "READ_WRITE".into(),
                },
            ))
            .await
            .unwrap()
            .into_inner()
            .key;
        let (key_id, _) = key.split_once('.').unwrap();

        let stored = ApiKeyStore::new(f.deps.datastore.clone(), Commander::Web)
            .get(key_id)
            .await
            .unwrap();
        stored.check_key(&key).unwrap();
        assert_eq!(stored.role, ApiKeyRole::ReadWrite);

        f.api
            .disable_api_key(f.request(ROLE_ADMIN, DisableApiKeyRequest { id: key_id.into() }))
            .await
            .unwrap();
        let active = f
            .api
            .list_api_keys(f.request(ROLE_ADMIN, ListApiKeysRequest { include_disabled: false }))
            .await
            .unwrap()
            .into_inner();
        assert!(active.keys_json.is_empty());
        let all = f
            .api
            .list_api_keys(f.request(ROLE_ADMIN, ListApiKeysRequest { include_disabled: true }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(all.keys_json.len(), 1);
        assert!(!all.keys_json[0].contains(&stored.key_hash));
    }

    #[tokio::test]
    async fn test_encrypt_secret() {
        let f = Fixture::new().await;
        let ciphertext = f
            .api
            .encrypt_secret(f.request(
                ROLE_ADMIN,
                EncryptSecretRequest {
                    piped_id: "piped-1".into(),
                    data: "hunter2".into(),
                },
            ))
            .await
            .unwrap()
            .into_inner()
            .ciphertext;
        assert_eq!(f.deps.encrypter.decrypt(&ciphertext).unwrap(), "hunter2");

        let err = f
            .api
            .encrypt_secret(f.request(
                ROLE_ADMIN,
                EncryptSecretRequest {
                    piped_id: "piped-x".into(),
                    data: "hunter2".into(),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[tokio::test]
    async fn test_get_me() {
        let f = Fixture::new().await;
        let me = f
            .api
            .get_me(f.request(ROLE_VIEWER, GetMeRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(me.subject, "alice");
        assert_eq!(me.project_id, "p");
        assert_eq!(me.role, ROLE_VIEWER);
    }
}
