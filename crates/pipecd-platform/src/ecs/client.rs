//! ECS client over the AWS JSON 1.1 protocol

use super::EcsProviderConfig;
use super::types::{Service, Tag, TaskDefinition, TaskSet};
use async_trait::async_trait;
use chrono::Utc;
use http::HeaderMap;
use http::header::{CONTENT_TYPE, HeaderValue};
use pipecd_common::sigv4::{Credentials, SigV4Signer};
use pipecd_common::{Error, Result};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const TARGET_PREFIX: &str = "AmazonEC2ContainerServiceV20141113";
const CONTENT_TYPE_JSON: &str = "application/x-amz-json-1.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// DescribeServices accepts at most ten services per call
pub const DESCRIBE_BATCH: usize = 10;

/// Fields of a described task definition that RegisterTaskDefinition rejects
const READ_ONLY_TASK_DEFINITION_FIELDS: &[&str] = &[
    "taskDefinitionArn",
    "revision",
    "status",
    "registeredAt",
    "registeredBy",
    "deregisteredAt",
    "requiresAttributes",
    "compatibilities",
];

#[async_trait]
pub trait EcsApi: Send + Sync {
    /// Create a service; only the `EXTERNAL` deployment controller is accepted
    async fn create_service(&self, service: &Service) -> Result<Service>;

    async fn update_service(&self, service: &Service) -> Result<Service>;

    /// Describe services with their tags; unknown services are left out
    async fn describe_services(&self, cluster: &str, services: &[String]) -> Result<Vec<Service>>;

    async fn list_clusters(&self) -> Result<Vec<String>>;

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>>;

    async fn register_task_definition(&self, task_definition: &TaskDefinition) -> Result<TaskDefinition>;

    async fn describe_task_definition(&self, task_definition: &str) -> Result<TaskDefinition>;

    async fn create_task_set(
        &self,
        service: &Service,
        task_definition: &TaskDefinition,
        scale_percent: f64,
        tags: &[Tag],
    ) -> Result<TaskSet>;

    async fn delete_task_set(&self, service: &Service, task_set_arn: &str) -> Result<()>;

    async fn update_service_primary_task_set(&self, service: &Service, task_set_arn: &str) -> Result<TaskSet>;

    async fn tag_resource(&self, resource_arn: &str, tags: &[Tag]) -> Result<()>;

    async fn list_tags(&self, resource_arn: &str) -> Result<Vec<Tag>>;
}

pub struct EcsClient {
    http: reqwest::Client,
    endpoint: Url,
    signer: SigV4Signer,
    credentials: Credentials,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// Map an AWS error type to the error kind callers branch on
fn api_error(status: u16, body: &str, operation: &str) -> Error {
    let Ok(err) = serde_json::from_str::<ApiError>(body) else {
        return Error::internal(format!("{operation}: unexpected status {status}: {body}"));
    };
    let kind = err.kind.rsplit('#').next().unwrap_or_default();
    let msg = format!("{operation}: {kind}: {}", err.message);
    match kind {
        k if k.ends_with("NotFoundException") => Error::not_found(msg),
        "AccessDeniedException" => Error::permission_denied(msg),
        "UnrecognizedClientException" | "InvalidSignatureException" | "ExpiredTokenException" => {
            Error::unauthenticated(msg)
        }
        "InvalidParameterException" | "ClientException" | "ValidationException" => Error::invalid_argument(msg),
        _ => Error::internal(msg),
    }
}

fn http_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::deadline_exceeded(e.to_string())
    } else {
        Error::internal(e.to_string())
    }
}

fn field<T: DeserializeOwned>(mut out: Value, name: &str, operation: &str) -> Result<T> {
    let value = out
        .get_mut(name)
        .map(Value::take)
        .ok_or_else(|| Error::internal(format!("{operation}: response has no {name}")))?;
    serde_json::from_value(value).map_err(|e| Error::internal(format!("{operation}: malformed {name}: {e}")))
}

impl EcsClient {
    pub fn new(endpoint: &str, region: &str, credentials: Credentials) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::configuration(format!("invalid endpoint {endpoint}: {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::internal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            signer: SigV4Signer::new(region, "ecs"),
            credentials,
        })
    }

    pub fn from_config(cfg: &EcsProviderConfig) -> Result<Self> {
        cfg.validate()?;
        let endpoint = cfg
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://ecs.{}.amazonaws.com/", cfg.region));
        Self::new(&endpoint, &cfg.region, cfg.credentials()?)
    }

    pub fn region(&self) -> &str {
        self.signer.region()
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, input: &Value) -> Result<T> {
        let body = serde_json::to_vec(input)?;
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
        let target = HeaderValue::from_str(&format!("{TARGET_PREFIX}.{operation}"))
            .map_err(|e| Error::internal(format!("invalid target {operation}: {e}")))?;
        headers.insert("x-amz-target", target);
        self.signer
            .sign(&self.credentials, "POST", &self.endpoint, &mut headers, &body, Utc::now())?;

        debug!(operation, "ecs request");
        let resp = self
            .http
            .request(Method::POST, self.endpoint.clone())
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(http_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(http_error)?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &text, operation));
        }
        let text = if text.is_empty() { "{}" } else { &text };
        serde_json::from_str(text).map_err(|e| Error::internal(format!("{operation}: malformed response: {e}")))
    }

    async fn paginate(&self, operation: &str, mut input: Value, items: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        loop {
            let mut page: Value = self.call(operation, &input).await?;
            if let Some(Value::Array(arns)) = page.get_mut(items).map(Value::take) {
                out.extend(arns.into_iter().filter_map(|v| v.as_str().map(str::to_string)));
            }
            match page.get("nextToken").and_then(Value::as_str) {
                Some(token) if !token.is_empty() => input["nextToken"] = Value::from(token),
                _ => return Ok(out),
            }
        }
    }
}

#[async_trait]
impl EcsApi for EcsClient {
    async fn create_service(&self, service: &Service) -> Result<Service> {
        if !service.uses_external_controller() {
            return Err(Error::invalid_argument(format!(
                "failed to create ECS service {}: deployment controller of type EXTERNAL is required",
                service.service_name
            )));
        }
        let mut input = serde_json::to_value(service)?;
        if let Value::Object(m) = &mut input {
            // Not accepted together with the EXTERNAL controller; task sets carry them
            for key in ["launchType", "networkConfiguration", "taskSets", "status", "serviceArn", "taskDefinition"] {
                m.remove(key);
            }
            if let Some(cluster) = m.remove("clusterArn") {
                m.insert("cluster".into(), cluster);
            }
        }
        let out = self.call("CreateService", &input).await?;
        let mut created: Service = field(out, "service", "CreateService")?;
        created.launch_type.clone_from(&service.launch_type);
        created.network_configuration.clone_from(&service.network_configuration);
        Ok(created)
    }

    async fn update_service(&self, service: &Service) -> Result<Service> {
        let mut input = json!({
            "cluster": service.cluster_arn,
            "service": service.service_name,
            "desiredCount": service.desired_count,
        });
        if let Some(strategy) = service.extra.get("placementStrategy") {
            input["placementStrategy"] = strategy.clone();
        }
        let out = self.call("UpdateService", &input).await?;
        let mut updated: Service = field(out, "service", "UpdateService")?;
        updated.launch_type.clone_from(&service.launch_type);
        updated.network_configuration.clone_from(&service.network_configuration);
        Ok(updated)
    }

    async fn describe_services(&self, cluster: &str, services: &[String]) -> Result<Vec<Service>> {
        let mut out = Vec::with_capacity(services.len());
        for chunk in services.chunks(DESCRIBE_BATCH) {
            let input = json!({ "cluster": cluster, "services": chunk, "include": ["TAGS"] });
            let resp = self.call("DescribeServices", &input).await?;
            let mut described: Vec<Service> = field(resp, "services", "DescribeServices")?;
            out.append(&mut described);
        }
        Ok(out)
    }

    async fn list_clusters(&self) -> Result<Vec<String>> {
        self.paginate("ListClusters", json!({}), "clusterArns").await
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>> {
        self.paginate("ListServices", json!({ "cluster": cluster }), "serviceArns").await
    }

    async fn register_task_definition(&self, task_definition: &TaskDefinition) -> Result<TaskDefinition> {
        let mut input = serde_json::to_value(task_definition)?;
        if let Value::Object(m) = &mut input {
            for key in READ_ONLY_TASK_DEFINITION_FIELDS {
                m.remove(*key);
            }
        }
        let out = self.call("RegisterTaskDefinition", &input).await?;
        field(out, "taskDefinition", "RegisterTaskDefinition")
    }

    async fn describe_task_definition(&self, task_definition: &str) -> Result<TaskDefinition> {
        let out = self
            .call("DescribeTaskDefinition", &json!({ "taskDefinition": task_definition }))
            .await?;
        field(out, "taskDefinition", "DescribeTaskDefinition")
    }

    async fn create_task_set(
        &self,
        service: &Service,
        task_definition: &TaskDefinition,
        scale_percent: f64,
        tags: &[Tag],
    ) -> Result<TaskSet> {
        if task_definition.task_definition_arn.is_empty() {
            return Err(Error::invalid_argument(format!(
                "failed to create task set of task family {}: no task definition provided",
                task_definition.family
            )));
        }
        let mut input = json!({
            "cluster": service.cluster_arn,
            "service": service.reference(),
            "taskDefinition": task_definition.task_definition_arn,
            "scale": { "unit": "PERCENT", "value": scale_percent },
        });
        if let Some(network) = &service.network_configuration {
            input["networkConfiguration"] = network.clone();
        }
        if !service.launch_type.is_empty() {
            input["launchType"] = Value::from(service.launch_type.as_str());
        }
        if !tags.is_empty() {
            input["tags"] = serde_json::to_value(tags)?;
        }
        let out = self.call("CreateTaskSet", &input).await?;
        field(out, "taskSet", "CreateTaskSet")
    }

    async fn delete_task_set(&self, service: &Service, task_set_arn: &str) -> Result<()> {
        let input = json!({
            "cluster": service.cluster_arn,
            "service": service.reference(),
            "taskSet": task_set_arn,
        });
        self.call::<Value>("DeleteTaskSet", &input).await.map(|_| ())
    }

    async fn update_service_primary_task_set(&self, service: &Service, task_set_arn: &str) -> Result<TaskSet> {
        let input = json!({
            "cluster": service.cluster_arn,
            "service": service.reference(),
            "primaryTaskSet": task_set_arn,
        });
        let out = self.call("UpdateServicePrimaryTaskSet", &input).await?;
        field(out, "taskSet", "UpdateServicePrimaryTaskSet")
    }

    async fn tag_resource(&self, resource_arn: &str, tags: &[Tag]) -> Result<()> {
        let input = json!({ "resourceArn": resource_arn, "tags": tags });
        self.call::<Value>("TagResource", &input).await.map(|_| ())
    }

    async fn list_tags(&self, resource_arn: &str) -> Result<Vec<Tag>> {
        let out: Value = self
            .call("ListTagsForResource", &json!({ "resourceArn": resource_arn }))
            .await?;
        if out.get("tags").is_none() {
            return Ok(Vec::new());
        }
        field(out, "tags", "ListTagsForResource")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::types::DeploymentController;
    use wiremock::matchers::{body_partial_json, header, header_exists, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(op: &str) -> String {
        format!("{TARGET_PREFIX}.{op}")
    }

    async fn client(server: &MockServer) -> EcsClient {
        EcsClient::new(&server.uri(), "ap-northeast-1", Credentials::new("AK", "SK")).unwrap()
    }

    fn service() -> Service {
        Service {
            service_name: "web".into(),
            cluster_arn: "arn:cluster".into(),
            desired_count: 2,
            deployment_controller: Some(DeploymentController { kind: "EXTERNAL".into() }),
            launch_type: "FARGATE".into(),
            network_configuration: Some(json!({"awsvpcConfiguration": {"subnets": ["s1"]}})),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_service_signs_and_strips_task_set_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("CreateService").as_str()))
            .and(header("content-type", CONTENT_TYPE_JSON))
            .and(header_exists("authorization"))
            .and(body_partial_json(json!({"cluster": "arn:cluster", "serviceName": "web"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "service": {"serviceName": "web", "serviceArn": "arn:svc", "clusterArn": "arn:cluster", "desiredCount": 2}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let created = client(&server).await.create_service(&service()).await.unwrap();
        assert_eq!(created.service_arn, "arn:svc");
        assert_eq!(created.launch_type, "FARGATE");
        assert!(created.network_configuration.is_some());

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("launchType").is_none());
        assert!(body.get("clusterArn").is_none());
    }

    #[tokio::test]
    async fn test_create_service_requires_external_controller() {
        let server = MockServer::start().await;
        let mut svc = service();
        svc.deployment_controller = None;
        let err = client(&server).await.create_service(&svc).await.unwrap_err();
        assert_eq!(err.kind(), pipecd_common::ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn test_error_types_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("DescribeTaskDefinition").as_str()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "com.amazonaws.ecs#ClusterNotFoundException", "message": "Cluster not found."
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("TagResource").as_str()))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "__type": "AccessDeniedException", "Message": "no"
            })))
            .mount(&server)
            .await;

        let c = client(&server).await;
        assert!(c.describe_task_definition("web:1").await.unwrap_err().is_not_found());
        let err = c.tag_resource("arn:svc", &[Tag::new("a", "b")]).await.unwrap_err();
        assert_eq!(err.kind(), pipecd_common::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_list_services_follows_next_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"nextToken": "t1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"serviceArns": ["arn:b"]})))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("ListServices").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"serviceArns": ["arn:a"], "nextToken": "t1"})))
            .with_priority(2)
            .mount(&server)
            .await;

        let arns = client(&server).await.list_services("arn:cluster").await.unwrap();
        assert_eq!(arns, vec!["arn:a", "arn:b"]);
    }

    #[tokio::test]
    async fn test_register_task_definition_drops_read_only_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-amz-target", target("RegisterTaskDefinition").as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "taskDefinition": {"family": "web", "taskDefinitionArn": "arn:td:web:3", "revision": 3, "containerDefinitions": []}
            })))
            .mount(&server)
            .await;

        let mut td = TaskDefinition { family: "web".into(), revision: 2, ..Default::default() };
        td.extra.insert("status".into(), json!("ACTIVE"));
        let registered = client(&server).await.register_task_definition(&td).await.unwrap();
        assert_eq!(registered.revision, 3);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("status").is_none());
        assert!(body.get("revision").is_none());
    }

    #[tokio::test]
    async fn test_create_task_set_needs_registered_definition() {
        let server = MockServer::start().await;
        let td = TaskDefinition { family: "web".into(), ..Default::default() };
        assert!(client(&server).await.create_task_set(&service(), &td, 100.0, &[]).await.is_err());
    }
}
