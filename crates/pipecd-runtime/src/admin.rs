//! Admin HTTP surface: `/version`, `/healthz`, `/metrics`

use axum::{
    Json, Router,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use metrics_exporter_prometheus::PrometheusHandle;
use pipecd_common::Result;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone, Debug, Serialize)]
struct VersionInfo {
    name: &'static str,
    version: &'static str,
}

/// Admin server of a control-plane binary
pub struct AdminServer {
    port: u16,
    name: &'static str,
    version: &'static str,
    metrics: Option<PrometheusHandle>,
    extra: Router,
}

impl AdminServer {
    pub fn new(port: u16, name: &'static str, version: &'static str) -> Self {
        Self {
            port,
            name,
            version,
            metrics: None,
            extra: Router::new(),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Mount additional admin routes
    #[must_use]
    pub fn merge(mut self, router: Router) -> Self {
        self.extra = self.extra.merge(router);
        self
    }

    pub fn router(&self) -> Router {
        let info = VersionInfo {
            name: self.name,
            version: self.version,
        };
        let metrics = self.metrics.clone();
        Router::new()
            .route(
                "/version",
                get(move || {
                    let info = info.clone();
                    async move { Json(info) }
                }),
            )
            .route("/healthz", get(|| async { "ok" }))
            .route(
                "/metrics",
                get(move || {
                    let body = metrics.as_ref().map(PrometheusHandle::render);
                    async move {
                        match body {
                            Some(body) => (
                                StatusCode::OK,
                                [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
                                body,
                            )
                                .into_response(),
                            None => StatusCode::NOT_FOUND.into_response(),
                        }
                    }
                }),
            )
            .merge(self.extra.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self, token: CancellationToken, grace: Duration) -> Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.router();
        crate::serve::serve_http("admin", addr, router, token, grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_admin_endpoints() {
        let admin = AdminServer::new(0, "pipecd-test", "v0.1.0");
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(crate::serve::serve_http_listener(
            "admin",
            listener,
            admin.router(),
            token.clone(),
            Duration::from_secs(1),
        ));

        let health = reqwest::get(format!("http://{addr}/healthz")).await.unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        let version: serde_json::Value = reqwest::get(format!("http://{addr}/version"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(version["version"], "v0.1.0");

        let metrics = reqwest::get(format!("http://{addr}/metrics")).await.unwrap();
        assert_eq!(metrics.status().as_u16(), 404);

        token.cancel();
        server.await.unwrap().unwrap();
    }
}
