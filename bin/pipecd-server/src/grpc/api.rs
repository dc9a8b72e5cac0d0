//! External API for pipectl and CI integrations

use super::{Deps, Endpoint, require_fields, sorted, to_json};
use crate::auth::{ApiKeyAuth, ApiKeyIdentity};
use pipecd_common::model::{Command, CommandStatus, CommandType, Event, EventStatus, now_unix};
use pipecd_common::{Error, Result};
use pipecd_datastore::{
    ApplicationStore, CommandStore, Commander, DeploymentStore, EventStore, ListOptions, Operator, PipedStore,
};
use pipecd_proto::apiservice::api_service_server::{ApiService, ApiServiceServer};
use pipecd_proto::apiservice::{
    GetApplicationRequest, GetApplicationResponse, GetCommandRequest, GetCommandResponse, GetDeploymentRequest,
    GetDeploymentResponse, GetPlanPreviewResultsRequest, GetPlanPreviewResultsResponse, RegisterEventRequest,
    RegisterEventResponse, RequestPlanPreviewRequest, RequestPlanPreviewResponse, SyncApplicationRequest,
    SyncApplicationResponse,
};
use pipecd_stores::CommandOutputStore;
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use uuid::Uuid;

require_fields! {
    GetApplicationRequest => [application_id];
    SyncApplicationRequest => [application_id];
    GetDeploymentRequest => [deployment_id];
    GetCommandRequest => [command_id];
    RegisterEventRequest => [name, data];
    RequestPlanPreviewRequest => [repo_remote_url, head_branch, head_commit, base_branch];
    GetPlanPreviewResultsRequest => [];
}

/// `git@host:org/repo.git` and `git@host:org/repo` name the same repository
fn same_remote(a: &str, b: &str) -> bool {
    let norm = |s: &str| s.trim_end_matches('/').trim_end_matches(".git").to_string();
    norm(a) == norm(b)
}

fn ensure_project(id: &ApiKeyIdentity, project_id: &str, what: &str) -> Result<()> {
    if project_id != id.project_id {
        return Err(Error::permission_denied(format!("requested {what} does not belong to the project")));
    }
    Ok(())
}

pub struct Api {
    endpoint: Endpoint<ApiKeyAuth>,
    handler: Handler,
}

impl Api {
    pub fn new(deps: &Deps, auth: Arc<ApiKeyAuth>) -> Self {
        Self {
            endpoint: Endpoint::new("APIService", auth),
            handler: Handler::new(deps),
        }
    }

    pub fn into_server(self) -> ApiServiceServer<Self> {
        ApiServiceServer::new(self)
    }
}

struct Handler {
    applications: ApplicationStore,
    deployments: DeploymentStore,
    commands: CommandStore,
    events: EventStore,
    pipeds: PipedStore,
    command_outputs: CommandOutputStore,
}

impl Handler {
    fn new(deps: &Deps) -> Self {
        let ds = &deps.datastore;
        Self {
            applications: ApplicationStore::new(ds.clone(), Commander::Pipectl),
            deployments: DeploymentStore::new(ds.clone(), Commander::Pipectl),
            commands: CommandStore::new(ds.clone(), Commander::Pipectl),
            events: EventStore::new(ds.clone(), Commander::Pipectl),
            pipeds: PipedStore::new(ds.clone(), Commander::Pipectl),
            command_outputs: CommandOutputStore::new(deps.filestore.clone()),
        }
    }

    async fn command(&self, id: &ApiKeyIdentity, command_id: &str) -> Result<Command> {
        let command = self.commands.get(command_id).await?;
        ensure_project(id, &command.project_id, "command")?;
        Ok(command)
    }

    async fn get_application(&self, id: ApiKeyIdentity, req: GetApplicationRequest) -> Result<GetApplicationResponse> {
        let app = self.applications.get(&req.application_id).await?;
        ensure_project(&id, &app.project_id, "application")?;
        Ok(GetApplicationResponse {
            application_json: to_json(&app)?,
        })
    }

    async fn sync_application(&self, id: ApiKeyIdentity, req: SyncApplicationRequest) -> Result<SyncApplicationResponse> {
        let app = self.applications.get(&req.application_id).await?;
        ensure_project(&id, &app.project_id, "application")?;
        if app.disabled {
            return Err(Error::invalid_argument(format!("application {} is disabled", app.id)));
        }
        let command = Command {
            id: Uuid::new_v4().to_string(),
            piped_id: app.piped_id,
            application_id: app.id.clone(),
            project_id: id.project_id,
            commander: id.key_id,
            kind: CommandType::SyncApplication,
            payload: json!({ "applicationId": app.id, "syncStrategy": "AUTO" }),
            created_at: now_unix(),
            ..Default::default()
        };
        let command = self.commands.add(command).await?;
        Ok(SyncApplicationResponse { command_id: command.id })
    }

    async fn get_deployment(&self, id: ApiKeyIdentity, req: GetDeploymentRequest) -> Result<GetDeploymentResponse> {
        let d = self.deployments.get(&req.deployment_id).await?;
        ensure_project(&id, &d.project_id, "deployment")?;
        Ok(GetDeploymentResponse {
            deployment_json: to_json(&d)?,
        })
    }

    async fn get_command(&self, id: ApiKeyIdentity, req: GetCommandRequest) -> Result<GetCommandResponse> {
        let command = self.command(&id, &req.command_id).await?;
        Ok(GetCommandResponse {
            command_json: to_json(&command)?,
        })
    }

    async fn register_event(&self, id: ApiKeyIdentity, req: RegisterEventRequest) -> Result<RegisterEventResponse> {
        let labels = sorted(req.labels);
        let now = now_unix();
        let event_key = Event::make_event_key(&req.name, &labels);
        let event = Event {
            id: Event::make_id(&req.name, &id.project_id, &event_key, now),
            name: req.name,
            data: req.data,
            project_id: id.project_id,
            labels,
            event_key,
            status: EventStatus::EventNotHandled,
            created_at: now,
            ..Default::default()
        };
        let event = self.events.add(event).await?;
        Ok(RegisterEventResponse { event_id: event.id })
    }

    /// One BuildPlanPreview command per piped watching the repository
    async fn request_plan_preview(
        &self,
        id: ApiKeyIdentity,
        req: RequestPlanPreviewRequest,
    ) -> Result<RequestPlanPreviewResponse> {
        let opts = ListOptions::default()
            .filter("ProjectId", Operator::Equal, id.project_id.as_str())
            .filter("Disabled", Operator::Equal, false);
        let pipeds = self.pipeds.list_all(&opts).await?;
        let now = now_unix();

        let mut commands = Vec::new();
        for piped in pipeds {
            let Some(repo) = piped
                .repositories
                .iter()
                .find(|r| same_remote(&r.remote, &req.repo_remote_url))
            else {
                continue;
            };
            let command = Command {
                id: Uuid::new_v4().to_string(),
                piped_id: piped.id.clone(),
                project_id: id.project_id.clone(),
                commander: id.key_id.clone(),
                kind: CommandType::BuildPlanPreview,
                payload: json!({
                    "repositoryId": repo.id,
                    "headBranch": req.head_branch,
                    "headCommit": req.head_commit,
                    "baseBranch": req.base_branch,
                }),
                created_at: now,
                ..Default::default()
            };
            commands.push(self.commands.add(command).await?.id);
        }
        if commands.is_empty() {
            return Err(Error::not_found(format!(
                "no piped is watching repository {}",
                req.repo_remote_url
            )));
        }
        Ok(RequestPlanPreviewResponse { commands })
    }

    /// Fails with NotFound until every command has been handled
    async fn get_plan_preview_results(
        &self,
        id: ApiKeyIdentity,
        req: GetPlanPreviewResultsRequest,
    ) -> Result<GetPlanPreviewResultsResponse> {
        let mut results_json = Vec::with_capacity(req.commands.len());
        for command_id in &req.commands {
            let command = self.command(&id, command_id).await?;
            if command.kind != CommandType::BuildPlanPreview {
                return Err(Error::invalid_argument(format!("command {command_id} is not a plan preview")));
            }
            match command.status {
                CommandStatus::CommandNotHandledYet => {
                    return Err(Error::not_found(format!("command {command_id} has not been handled yet")));
                }
                CommandStatus::CommandSucceeded => {
                    let output = self.command_outputs.get(command_id).await?;
                    results_json.push(String::from_utf8_lossy(&output).into_owned());
                }
                status => {
                    results_json.push(
                        json!({
                            "commandId": command_id,
                            "pipedId": command.piped_id,
                            "status": status,
                            "error": "plan preview command did not succeed",
                        })
                        .to_string(),
                    );
                }
            }
        }
        Ok(GetPlanPreviewResultsResponse { results_json })
    }
}

type Reply<T> = std::result::Result<Response<T>, Status>;

#[tonic::async_trait]
impl ApiService for Api {
    async fn get_application(&self, request: Request<GetApplicationRequest>) -> Reply<GetApplicationResponse> {
        self.endpoint
            .unary("GetApplication", request, |id, req| self.handler.get_application(id, req))
            .await
    }

    async fn sync_application(&self, request: Request<SyncApplicationRequest>) -> Reply<SyncApplicationResponse> {
        self.endpoint
            .unary("SyncApplication", request, |id, req| self.handler.sync_application(id, req))
            .await
    }

    async fn get_deployment(&self, request: Request<GetDeploymentRequest>) -> Reply<GetDeploymentResponse> {
        self.endpoint
            .unary("GetDeployment", request, |id, req| self.handler.get_deployment(id, req))
            .await
    }

    async fn get_command(&self, request: Request<GetCommandRequest>) -> Reply<GetCommandResponse> {
        self.endpoint
            .unary("GetCommand", request, |id, req| self.handler.get_command(id, req))
            .await
    }

    async fn register_event(&self, request: Request<RegisterEventRequest>) -> Reply<RegisterEventResponse> {
        self.endpoint
            .unary("RegisterEvent", request, |id, req| self.handler.register_event(id, req))
            .await
    }

    async fn request_plan_preview(
        &self,
        request: Request<RequestPlanPreviewRequest>,
    ) -> Reply<RequestPlanPreviewResponse> {
        self.endpoint
            .unary("RequestPlanPreview", request, |id, req| self.handler.request_plan_preview(id, req))
            .await
    }

    async fn get_plan_preview_results(
        &self,
        request: Request<GetPlanPreviewResultsRequest>,
    ) -> Reply<GetPlanPreviewResultsResponse> {
        self.endpoint
            .unary("GetPlanPreviewResults", request, |id, req| {
                self.handler.get_plan_preview_results(id, req)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use bytes::Bytes;
    use pipecd_common::model::{ApiKey, ApiKeyRole, Application, ApplicationGitRepository, Piped};
    use pipecd_datastore::ApiKeyStore;
    use pipecd_stores::ApiKeyLastUsedStore;
    use std::collections::BTreeMap;
    use tonic::Code;
    use tonic::metadata::MetadataValue;

    const RO_KEY: &str = "ro.secret";
    const RW_KEY: &str = "rw.secret";

    async fn setup() -> (Api, Deps) {
        let deps = testing::deps();
        let ds = deps.datastore.clone();
        let keys = ApiKeyStore::new(ds.clone(), Commander::Web);
        for (key, role) in [(RO_KEY, ApiKeyRole::ReadOnly), (RW_KEY, ApiKeyRole::ReadWrite)] {
            let (key_id, _) = key.split_once('.').unwrap();
            let mut api_key = ApiKey {
                id: key_id.into(),
                name: key_id.into(),
                project_id: "p".into(),
                role,
                ..Default::default()
            };
            api_key.set_key_hash(key);
            keys.add(api_key).await.unwrap();
        }
        let pipeds = PipedStore::new(ds.clone(), Commander::Web);
        for (piped_id, remote) in [
            ("piped-1", "git@github.com:org/repo.git"),
            ("piped-2", "git@github.com:org/repo"),
            ("piped-3", "git@github.com:org/other.git"),
        ] {
            pipeds
                .add(Piped {
                    id: piped_id.into(),
                    name: piped_id.into(),
                    project_id: "p".into(),
                    repositories: vec![ApplicationGitRepository {
                        id: "repo".into(),
                        remote: remote.into(),
                        branch: "main".into(),
                    }],
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        ApplicationStore::new(ds.clone(), Commander::Web)
            .add(Application {
                id: "app".into(),
                name: "app".into(),
                piped_id: "piped-1".into(),
                project_id: "p".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let auth = ApiKeyAuth::new(
            Arc::new(ApiKeyStore::new(ds, Commander::Pipectl)),
            ApiKeyLastUsedStore::new(deps.api_key_last_used.clone()),
        );
        (Api::new(&deps, Arc::new(auth)), deps)
    }

    fn request<T>(key: &str, msg: T) -> Request<T> {
        let mut req = Request::new(msg);
        req.metadata_mut().insert(
            "authorization",
            MetadataValue::try_from(format!("API-KEY {key}")).unwrap(),
        );
        req
    }

    #[tokio::test]
    async fn test_sync_requires_read_write_key() {
        let (api, deps) = setup().await;
        let msg = || SyncApplicationRequest {
            application_id: "app".into(),
        };
        let err = api.sync_application(request(RO_KEY, msg())).await.unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);

        let command_id = api
            .sync_application(request(RW_KEY, msg()))
            .await
            .unwrap()
            .into_inner()
            .command_id;
        let command = CommandStore::new(deps.datastore, Commander::Web)
            .get(&command_id)
            .await
            .unwrap();
        assert_eq!(command.piped_id, "piped-1");
        assert_eq!(command.commander, "rw");

        let app = api
            .get_application(request(
                RO_KEY,
                GetApplicationRequest {
                    application_id: "app".into(),
                },
            ))
            .await
            .unwrap()
            .into_inner();
        assert!(app.application_json.contains("piped-1"));
    }

    #[tokio::test]
    async fn test_register_event() {
        let (api, deps) = setup().await;
        let labels = [("env".to_string(), "prod".to_string())].into_iter().collect();
        let event_id = api
            .register_event(request(
                RW_KEY,
                RegisterEventRequest {
                    name: "image-update".into(),
                    data: "v2".into(),
                    labels,
                },
            ))
            .await
            .unwrap()
            .into_inner()
            .event_id;
        let event = EventStore::new(deps.datastore, Commander::Web).get(&event_id).await.unwrap();
        assert_eq!(event.status, EventStatus::EventNotHandled);
        let labels = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        assert_eq!(event.event_key, Event::make_event_key("image-update", &labels));
    }

    #[tokio::test]
    async fn test_plan_preview_round_trip() {
        let (api, deps) = setup().await;
        let commands = api
            .request_plan_preview(request(
                RW_KEY,
                RequestPlanPreviewRequest {
                    repo_remote_url: "git@github.com:org/repo.git".into(),
                    head_branch: "feature".into(),
                    head_commit: "abc".into(),
                    base_branch: "main".into(),
                },
            ))
            .await
            .unwrap()
            .into_inner()
            .commands;
        assert_eq!(commands.len(), 2);

        let results = || {
            request(
                RO_KEY,
                GetPlanPreviewResultsRequest {
                    commands: commands.clone(),
                },
            )
        };
        let err = api.get_plan_preview_results(results()).await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let store = CommandStore::new(deps.datastore.clone(), Commander::Piped);
        let outputs = CommandOutputStore::new(deps.filestore.clone());
        for (i, id) in commands.iter().enumerate() {
            if i == 0 {
                outputs.put(id, Bytes::from_static(b"{\"changes\":1}")).await.unwrap();
                store
                    .update_handled(id, CommandStatus::CommandSucceeded, &BTreeMap::new(), 1)
                    .await
                    .unwrap();
            } else {
                store
                    .update_handled(id, CommandStatus::CommandTimeout, &BTreeMap::new(), 1)
                    .await
                    .unwrap();
            }
        }
        let resp = api.get_plan_preview_results(results()).await.unwrap().into_inner();
        assert_eq!(resp.results_json[0], "{\"changes\":1}");
        assert!(resp.results_json[1].contains("COMMAND_TIMEOUT"));

        let err = api
            .request_plan_preview(request(
                RW_KEY,
                RequestPlanPreviewRequest {
                    repo_remote_url: "git@github.com:org/unknown.git".into(),
                    head_branch: "feature".into(),
                    head_commit: "abc".into(),
                    base_branch: "main".into(),
                },
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_same_remote() {
        assert!(same_remote("git@github.com:org/repo.git", "git@github.com:org/repo"));
        assert!(same_remote("https://github.com/org/repo/", "https://github.com/org/repo"));
        assert!(!same_remote("git@github.com:org/repo", "git@github.com:org/repo2"));
    }
}
