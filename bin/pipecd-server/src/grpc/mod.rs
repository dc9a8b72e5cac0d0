//! gRPC endpoints of the control plane
//!
//! Every unary call goes through [`Endpoint::unary`]: authenticate, validate
//! the request, run the handler, map the error to a status and record the
//! call metrics. Request logging is the tower trace layer installed by
//! [`serve`].

pub mod api;
pub mod authz;
pub mod piped_api;
pub mod web_api;

use crate::auth::Authenticator;
use crate::encryption::Encrypter;
use crate::jwt::JwtManager;
use pipecd_cache::{Cache, HashCache};
use pipecd_common::{ControlPlaneConfig, Error, ErrorKind, Result};
use pipecd_datastore::DataStore;
use pipecd_filestore::Store;
use pipecd_runtime::CancellationToken;
use pipecd_runtime::metrics::record_grpc_call;
use pipecd_stores::{PipedStatStore, UnregisteredAppStore};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::service::{Routes, RoutesBuilder};
use tonic::transport::{Server, ServerTlsConfig};
use tonic::{Code, Request, Response, Status};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared handles every API is built from
#[derive(Clone)]
pub struct Deps {
    pub datastore: Arc<dyn DataStore>,
    pub filestore: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub piped_stats: Arc<PipedStatStore>,
    pub unregistered_apps: Arc<UnregisteredAppStore>,
    pub api_key_last_used: Arc<dyn HashCache>,
    pub encrypter: Arc<Encrypter>,
    pub jwt: Arc<JwtManager>,
    pub config: Arc<ControlPlaneConfig>,
}

/// Request-level checks run after authentication
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

pub fn require(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::invalid_argument(format!("{field} is required")));
    }
    Ok(())
}

/// `Validate` requiring the listed string fields to be non-empty
macro_rules! require_fields {
    ($($ty:ty => [$($field:ident),* $(,)?]);* $(;)?) => {
        $(
            impl $crate::grpc::Validate for $ty {
                fn validate(&self) -> pipecd_common::Result<()> {
                    $($crate::grpc::require(stringify!($field), &self.$field)?;)*
                    Ok(())
                }
            }
        )*
    };
}
pub(crate) use require_fields;

pub fn to_status(e: &Error) -> Status {
    let msg = e.to_string();
    match e.kind() {
        ErrorKind::NotFound => Status::not_found(msg),
        ErrorKind::AlreadyExists => Status::already_exists(msg),
        ErrorKind::Unsupported => Status::unimplemented(msg),
        ErrorKind::InvalidArgument => Status::invalid_argument(msg),
        ErrorKind::Unauthenticated => Status::unauthenticated(msg),
        ErrorKind::PermissionDenied => Status::permission_denied(msg),
        ErrorKind::DeadlineExceeded => Status::deadline_exceeded(msg),
        ErrorKind::Cancelled => Status::cancelled(msg),
        ErrorKind::Internal => Status::internal("internal error"),
    }
}

pub struct Endpoint<A> {
    service: &'static str,
    auth: Arc<A>,
}

impl<A: Authenticator> Endpoint<A> {
    pub const fn new(service: &'static str, auth: Arc<A>) -> Self {
        Self { service, auth }
    }

    pub async fn unary<Req, Resp, F, Fut>(
        &self,
        method: &'static str,
        request: Request<Req>,
        handler: F,
    ) -> std::result::Result<Response<Resp>, Status>
    where
        Req: Validate,
        F: FnOnce(A::Identity, Req) -> Fut,
        Fut: Future<Output = Result<Resp>>,
    {
        let start = Instant::now();
        let result = async {
            let identity = self.auth.authenticate(method, request.metadata()).await?;
            let req = request.into_inner();
            req.validate()?;
            handler(identity, req).await
        }
        .await;

        let (code, out) = match result {
            Ok(resp) => (Code::Ok, Ok(Response::new(resp))),
            Err(e) => {
                match e.kind() {
                    ErrorKind::Internal => error!(service = self.service, method, error = %e, "request failed"),
                    ErrorKind::Unauthenticated | ErrorKind::PermissionDenied => {
                        warn!(service = self.service, method, error = %e, "request rejected");
                    }
                    _ => {}
                }
                let status = to_status(&e);
                (status.code(), Err(status))
            }
        };
        record_grpc_call(self.service, method, &format!("{code:?}"), start.elapsed().as_secs_f64());
        out
    }
}

pub fn parse_enum<T: DeserializeOwned>(field: &str, value: &str) -> Result<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string()))
        .map_err(|_| Error::invalid_argument(format!("{field} has unknown value {value:?}")))
}

pub fn from_json<T: DeserializeOwned>(field: &str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::invalid_argument(format!("{field} is not a valid document: {e}")))
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

pub fn to_json_all<T: Serialize>(values: &[T]) -> Result<Vec<String>> {
    values.iter().map(to_json).collect()
}

pub fn sorted(map: HashMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter().collect()
}

/// Settings shared by the four gRPC listeners
#[derive(Clone, Default)]
pub struct ServeOptions {
    pub tls: Option<ServerTlsConfig>,
    pub reflection: bool,
}

/// Routes for `svc`, with gRPC reflection when `reflection` is set
pub fn routes<S>(svc: S, reflection: bool) -> Result<Routes>
where
    S: tonic::codegen::Service<
            http::Request<tonic::body::BoxBody>,
            Response = http::Response<tonic::body::BoxBody>,
            Error = std::convert::Infallible,
        > + tonic::server::NamedService
        + Clone
        + Send
        + 'static,
    S::Future: Send + 'static,
{
    let mut builder = RoutesBuilder::default();
    builder.add_service(svc);
    if reflection {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(pipecd_proto::FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| Error::internal(format!("failed to build reflection service: {e}")))?;
        builder.add_service(reflection);
    }
    Ok(builder.routes())
}

/// Serve `routes` on `addr` until `token` is cancelled, draining for `grace`
pub async fn serve(
    name: &'static str,
    addr: SocketAddr,
    routes: Routes,
    tls: Option<ServerTlsConfig>,
    token: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let mut builder = Server::builder();
    if let Some(tls) = tls {
        builder = builder
            .tls_config(tls)
            .map_err(|e| Error::configuration(format!("invalid tls config for {name}: {e}")))?;
    }
    info!(server = name, %addr, "start running grpc server");
    pipecd_runtime::serve::run_with_grace(name, token, grace, move |shutdown| async move {
        builder
            .layer(TraceLayer::new_for_grpc())
            .add_routes(routes)
            .serve_with_shutdown(addr, shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::internal(format!("{name} server failed: {e}")))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::PipedIdentity;
    use async_trait::async_trait;
    use tonic::metadata::MetadataMap;

    struct AllowAll;

    #[async_trait]
    impl Authenticator for AllowAll {
        type Identity = PipedIdentity;

        async fn authenticate(&self, method: &str, _metadata: &MetadataMap) -> Result<PipedIdentity> {
            if method == "Denied" {
                return Err(Error::permission_denied("nope"));
            }
            Ok(PipedIdentity {
                project_id: "p".into(),
                piped_id: "piped".into(),
            })
        }
    }

    struct Named {
        name: String,
    }

    require_fields!(Named => [name]);

    #[tokio::test]
    async fn test_unary_pipeline() {
        let ep = Endpoint::new("test", Arc::new(AllowAll));
        let resp = ep
            .unary("Ok", Request::new(Named { name: "x".into() }), |id, req| async move {
                Ok(format!("{}/{}", id.piped_id, req.name))
            })
            .await
            .unwrap();
        assert_eq!(resp.into_inner(), "piped/x");

        let err = ep
            .unary("Ok", Request::new(Named { name: String::new() }), |_, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = ep
            .unary("Denied", Request::new(Named { name: "x".into() }), |_, _| async { Ok(()) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::PermissionDenied);
    }

    #[test]
    fn test_to_status() {
        assert_eq!(to_status(&Error::not_found("x")).code(), Code::NotFound);
        assert_eq!(to_status(&Error::unsupported("x")).code(), Code::Unimplemented);
        assert_eq!(to_status(&Error::configuration("x")).code(), Code::InvalidArgument);
        let internal = to_status(&Error::internal("db password leaked"));
        assert_eq!(internal.code(), Code::Internal);
        assert_eq!(internal.message(), "internal error");
    }

    #[test]
    fn test_parse_enum() {
        use pipecd_common::model::DeploymentStatus;
        let s: DeploymentStatus = parse_enum("status", "DEPLOYMENT_RUNNING").unwrap();
        assert_eq!(s, DeploymentStatus::DeploymentRunning);
        assert!(parse_enum::<DeploymentStatus>("status", "RUNNING").is_err());
    }
}
