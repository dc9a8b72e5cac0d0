//! External authorization for the envoy front proxy
//!
//! Envoy forwards the headers of every piped request here. An allowed check
//! carries the resolved project and piped ids upstream as headers.

use crate::auth::{AUTHORIZATION, PipedTokenAuth};
use pipecd_proto::authz::authorization_server::{Authorization, AuthorizationServer};
use pipecd_proto::authz::{CheckRequest, CheckResponse};
use pipecd_runtime::metrics::record_grpc_call;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tonic::{Code, Request, Response, Status};
use tracing::debug;

pub const PROJECT_ID_HEADER: &str = "x-pipecd-project-id";
pub const PIPED_ID_HEADER: &str = "x-pipecd-piped-id";

pub struct AuthzApi {
    auth: Arc<PipedTokenAuth>,
}

impl AuthzApi {
    pub const fn new(auth: Arc<PipedTokenAuth>) -> Self {
        Self { auth }
    }

    pub fn into_server(self) -> AuthorizationServer<Self> {
        AuthorizationServer::new(self)
    }

    async fn check_headers(&self, headers: &HashMap<String, String>) -> CheckResponse {
        let header = headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(AUTHORIZATION))
            .map(|(_, v)| v.as_str());
        let Some(header) = header else {
            return CheckResponse {
                status: Code::Unauthenticated as i32,
                message: "missing piped token".into(),
                headers: HashMap::new(),
            };
        };
        match self.auth.verify_header(header).await {
            Ok(id) => CheckResponse {
                status: Code::Ok as i32,
                message: String::new(),
                headers: HashMap::from([
                    (PROJECT_ID_HEADER.to_string(), id.project_id),
                    (PIPED_ID_HEADER.to_string(), id.piped_id),
                ]),
            },
            Err(e) => {
                debug!(error = %e, "rejected piped request");
                CheckResponse {
                    status: Code::Unauthenticated as i32,
                    message: e.to_string(),
                    headers: HashMap::new(),
                }
            }
        }
    }
}

#[tonic::async_trait]
impl Authorization for AuthzApi {
    async fn check(&self, request: Request<CheckRequest>) -> Result<Response<CheckResponse>, Status> {
        let start = Instant::now();
        let resp = self.check_headers(&request.into_inner().headers).await;
        let code = format!("{:?}", Code::from_i32(resp.status));
        record_grpc_call("Authorization", "Check", &code, start.elapsed().as_secs_f64());
        Ok(Response::new(resp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use pipecd_common::model::{Piped, hash_id};
    use pipecd_datastore::{Commander, PipedStore};

    async fn api() -> AuthzApi {
        let ds = testing::datastore();
        let mut piped = Piped {
            id: "piped-1".into(),
            name: "dev".into(),
            project_id: "p".into(),
            ..Default::default()
        };
        piped.add_key(hash_id(&["secret"]), "alice", 1).unwrap();
        PipedStore::new(ds.clone(), Commander::Web).add(piped).await.unwrap();
        AuthzApi::new(Arc::new(PipedTokenAuth::new(Arc::new(PipedStore::new(ds, Commander::Piped)))))
    }

    fn check(header: Option<&str>) -> Request<CheckRequest> {
        let headers = header
            .map(|h| HashMap::from([("Authorization".to_string(), h.to_string())]))
            .unwrap_or_default();
        Request::new(CheckRequest {
            path: "/pipecd.pipedservice.PipedService/Ping".into(),
            headers,
        })
    }

    #[tokio::test]
    async fn test_check_allows_valid_token() {
        let api = api().await;
        let resp = api
            .check(check(Some("PIPED-TOKEN p,piped-1,secret")))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(resp.status, 0);
        assert_eq!(resp.headers[PROJECT_ID_HEADER], "p");
        assert_eq!(resp.headers[PIPED_ID_HEADER], "piped-1");
    }

    #[tokio::test]
    async fn test_check_rejects_bad_credentials() {
        let api = api().await;
        for header in [None, Some("PIPED-TOKEN p,piped-1,wrong"), Some("Bearer token")] {
            let resp = api.check(check(header)).await.unwrap().into_inner();
            assert_eq!(resp.status, Code::Unauthenticated as i32);
            assert!(resp.headers.is_empty());
        }
    }
}
