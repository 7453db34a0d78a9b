//! Controller runtime
//!
//! Runs the `Istio` and `RemoteIstio` controllers side by side, serves the
//! health endpoints, and turns SIGINT/SIGTERM into a cancellation that aborts
//! in-flight apply calls and drains both controllers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::controller::{error_policy, reconcile, reconcile_remote, remote_error_policy, Context};
use crate::crd::{Istio, RemoteIstio};
use crate::reconcile::EngineConfig;
use crate::resources::rendered::RenderedComponent;

/// Runtime settings
pub struct RunnerConfig {
    /// Bind address of the health endpoints
    pub metrics_addr: SocketAddr,
    /// Engine settings
    pub engine: EngineConfig,
    /// Pre-rendered components applied to every mesh
    pub rendered: Vec<RenderedComponent>,
}

/// Parse a bind address, accepting the `:port` shorthand for all interfaces
pub fn parse_bind_addr(addr: &str) -> Result<SocketAddr, String> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid bind address {addr:?}: {e}"))
}

/// Router serving `/healthz` and `/readyz`
pub fn health_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .with_state(ready)
}

async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "starting")
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
        _ = cancel.cancelled() => {}
    }
    info!("shutdown requested");
    cancel.cancel();
}

/// Run both controllers until shutdown
pub async fn run(client: Client, config: RunnerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let ready = Arc::new(AtomicBool::new(false));

    let listener = tokio::net::TcpListener::bind(config.metrics_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", config.metrics_addr, e))?;
    info!(addr = %config.metrics_addr, "serving health endpoints");
    let health = {
        let router = health_router(ready.clone());
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!(error = %e, "health server failed");
            }
        })
    };

    tokio::spawn(shutdown_signal(cancel.clone()));

    let ctx = Arc::new(Context::new(
        client.clone(),
        config.engine,
        cancel.clone(),
        config.rendered,
    ));

    let meshes: Api<Istio> = Api::all(client.clone());
    let remotes: Api<RemoteIstio> = Api::all(client);

    info!("starting mesh controllers");
    let mesh_controller = {
        let cancel = cancel.clone();
        Controller::new(meshes, WatcherConfig::default())
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(reconcile, error_policy, ctx.clone())
            .for_each(|result| async move {
                match result {
                    Ok((mesh, action)) => debug!(%mesh, ?action, "mesh reconciliation completed"),
                    Err(e) => error!(error = ?e, "mesh reconciliation error"),
                }
            })
    };
    let remote_controller = {
        let cancel = cancel.clone();
        Controller::new(remotes, WatcherConfig::default())
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(reconcile_remote, remote_error_policy, ctx)
            .for_each(|result| async move {
                match result {
                    Ok((peer, action)) => debug!(%peer, ?action, "peer reconciliation completed"),
                    Err(e) => error!(error = ?e, "peer reconciliation error"),
                }
            })
    };
    ready.store(true, Ordering::Relaxed);

    tokio::join!(mesh_controller, remote_controller);
    cancel.cancel();
    if let Err(e) = health.await {
        error!(error = %e, "health server task panicked");
    }
    info!("mesh operator stopped");
    Ok(())
}
