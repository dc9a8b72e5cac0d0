//! Graceful serving helpers
//!
//! A server runs in a child task. When the group token is cancelled the
//! child receives its own shutdown token and is given `grace` to drain
//! in-flight requests before it is aborted.

use axum::Router;
use pipecd_common::{Error, Result};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Drive `make(shutdown)` until it exits or `token` is cancelled
pub async fn run_with_grace<F, Fut>(
    name: &str,
    token: CancellationToken,
    grace: Duration,
    make: F,
) -> Result<()>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let shutdown = CancellationToken::new();
    let mut handle = tokio::spawn(make(shutdown.clone()));

    tokio::select! {
        res = &mut handle => {
            return res.map_err(|e| Error::internal(format!("{name} task failed: {e}")))?;
        }
        () = token.cancelled() => {}
    }

    info!(server = name, grace_secs = grace.as_secs(), "stopping server");
    shutdown.cancel();
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(res) => res.map_err(|e| Error::internal(format!("{name} task failed: {e}")))?,
        Err(_) => {
            warn!(server = name, "grace period elapsed, aborting in-flight work");
            handle.abort();
            Ok(())
        }
    }
}

/// Bind `addr` and serve `router` with graceful shutdown
pub async fn serve_http(
    name: &'static str,
    addr: SocketAddr,
    router: Router,
    token: CancellationToken,
    grace: Duration,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(server = name, %addr, "start running http server");
    serve_http_listener(name, listener, router, token, grace).await
}

/// Serve on an already bound listener
pub async fn serve_http_listener(
    name: &'static str,
    listener: TcpListener,
    router: Router,
    token: CancellationToken,
    grace: Duration,
) -> Result<()> {
    run_with_grace(name, token, grace, move |shutdown| async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
            .map_err(|e| Error::internal(format!("{name} server failed: {e}")))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_with_grace_returns_server_error() {
        let token = CancellationToken::new();
        let err = run_with_grace("x", token, Duration::from_secs(1), |_| async {
            Err(Error::internal("bind failed"))
        })
        .await
        .unwrap_err();
        assert!(err.to_string().contains("bind failed"));
    }

    #[tokio::test]
    async fn test_run_with_grace_drains() {
        let token = CancellationToken::new();
        let t = token.clone();
        let task = tokio::spawn(run_with_grace("x", t, Duration::from_secs(5), |shutdown| async move {
            shutdown.cancelled().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }));
        token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_grace_aborts_after_grace() {
        let token = CancellationToken::new();
        token.cancel();
        run_with_grace("x", token, Duration::from_secs(1), |_| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        })
        .await
        .unwrap();
    }
}
