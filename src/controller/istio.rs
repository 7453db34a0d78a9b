//! Istio controller
//!
//! One pass resolves the mesh, converges every enabled component in the
//! local cluster, then syncs each registered peer. Peer failures are recorded
//! on the peer's `RemoteIstio` status and never fail the mesh.
//!
//! Status is only written when it differs from what the resource already
//! reports, so a converged mesh produces no writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{
    Condition, ConditionStatus, Istio, IstioStatus, MeshPhase, RemoteIstio, RemoteIstioStatus,
};
use crate::defaults;
use crate::metrics::ReconcileTimer;
use crate::reconcile::Ownership;
use crate::resources::{builders, MeshConfig};
use crate::{Error, Result};

use super::remote::{record, to_status};
use super::{has_finalizer, Context, PERMANENT_FAILURE_INTERVAL, RESYNC_INTERVAL, RETRY_INTERVAL};

/// Reconcile one `Istio` resource
#[instrument(skip(istio, ctx), fields(mesh = %istio.name_any()))]
pub async fn reconcile(istio: Arc<Istio>, ctx: Arc<Context>) -> Result<Action> {
    let name = istio.name_any();
    let namespace = istio.namespace().unwrap_or_default();

    if istio.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&istio, &ctx).await;
    }
    if !has_finalizer(&istio.metadata) {
        ctx.kube.add_istio_finalizer(&namespace, &name).await?;
    }

    let timer = ReconcileTimer::start(format!("{namespace}/{name}"));
    let generation = istio.metadata.generation;

    let config = match resolve(&istio) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "mesh configuration rejected");
            set_status(&ctx, &istio, failed(&e, generation)).await?;
            timer.error(e.kind());
            return Ok(Action::await_change());
        }
    };

    let observed = istio.status.as_ref().and_then(|s| s.observed_generation);
    if observed != generation {
        set_status(
            &ctx,
            &istio,
            IstioStatus::with_phase(MeshPhase::Reconciling, "converging components"),
        )
        .await?;
    }

    let builders = builders(&config, &ctx.rendered);
    let report = match ctx
        .engine
        .apply_components(
            ctx.cluster.as_ref(),
            &config,
            &builders,
            &Ownership::controller(&config),
        )
        .await
    {
        Ok(report) => report,
        Err(e) => {
            set_status(&ctx, &istio, failed(&e, generation)).await?;
            timer.error(e.kind());
            return Err(e);
        }
    };
    info!(
        created = report.created,
        updated = report.updated,
        unchanged = report.unchanged,
        "local control plane converged"
    );

    sync_peers(&ctx, &namespace, &config).await?;

    let available = IstioStatus::with_phase(MeshPhase::Available, "all components converged")
        .observed(generation)
        .condition(Condition::new(
            "Ready",
            ConditionStatus::True,
            "Reconciled",
            "all enabled components converged",
        ));
    set_status(&ctx, &istio, available).await?;
    timer.success();
    Ok(Action::requeue(RESYNC_INTERVAL))
}

/// Remove what garbage collection cannot, then release the finalizer
///
/// Cluster-scoped objects in the local cluster must go before the finalizer
/// is released; a failure there is retried. Peers are cleaned up best
/// effort, since an unreachable peer must not keep the mesh alive.
async fn handle_deletion(istio: &Istio, ctx: &Context) -> Result<Action> {
    if !has_finalizer(&istio.metadata) {
        return Ok(Action::await_change());
    }
    let name = istio.name_any();
    let namespace = istio.namespace().unwrap_or_default();
    let config = MeshConfig::from_istio(istio)?;

    let deleted = ctx
        .engine
        .delete_owned(
            ctx.cluster.as_ref(),
            &Ownership::controller(&config),
            &namespace,
        )
        .await?;
    info!(deleted, "cluster-scoped mesh objects removed");

    let peers = match ctx.kube.list_remotes(&namespace).await {
        Ok(peers) => peers,
        Err(e) => {
            warn!(error = %e, "could not list peers, skipping peer cleanup");
            Vec::new()
        }
    };
    for (peer, outcome) in ctx.remotes.cleanup_all(&config, &peers).await {
        if let Err(e) = outcome {
            warn!(cluster = %peer, error = %e, "peer cleanup failed");
        }
    }

    ctx.kube.remove_istio_finalizer(&namespace, &name).await?;
    info!("mesh deleted");
    Ok(Action::await_change())
}

fn resolve(istio: &Istio) -> Result<MeshConfig> {
    let config = MeshConfig::from_istio(istio)?;
    defaults::validate(&config.spec)?;
    Ok(config)
}

/// Sync every registered peer of the namespace and record each outcome
async fn sync_peers(ctx: &Context, namespace: &str, config: &MeshConfig) -> Result<()> {
    let peers: Vec<RemoteIstio> = ctx
        .kube
        .list_remotes(namespace)
        .await?
        .into_iter()
        .filter(|r| ctx.remotes.contains(&r.name_any()))
        .collect();
    if peers.is_empty() {
        return Ok(());
    }

    let current: BTreeMap<String, Option<RemoteIstioStatus>> = peers
        .iter()
        .map(|r| (r.name_any(), r.status.clone()))
        .collect();
    for (peer, outcome) in ctx.remotes.sync_all(config, &peers).await {
        if let Err(e) = &outcome {
            debug!(cluster = %peer, error = %e, "peer sync failed");
        }
        let Some(status) = ctx.remotes.status(&peer) else {
            continue;
        };
        let previous = current.get(&peer).and_then(Option::as_ref);
        record(ctx, namespace, &peer, previous, to_status(&status)).await;
    }
    Ok(())
}

fn failed(error: &Error, generation: Option<i64>) -> IstioStatus {
    IstioStatus::with_phase(MeshPhase::Failed, error.to_string())
        .observed(generation)
        .condition(Condition::new(
            "Ready",
            ConditionStatus::False,
            error.kind(),
            error.to_string(),
        ))
}

/// Patch the mesh status unless the resource already reports it
async fn set_status(ctx: &Context, istio: &Istio, status: IstioStatus) -> Result<()> {
    let previous = istio.status.as_ref();
    let status = status.since(previous);
    if previous == Some(&status) {
        debug!(phase = %status.phase, "status unchanged");
        return Ok(());
    }
    let namespace = istio.namespace().unwrap_or_default();
    ctx.kube
        .patch_istio_status(&namespace, &istio.name_any(), &status)
        .await
}

/// Requeue policy for failed `Istio` passes
pub fn error_policy(istio: Arc<Istio>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        mesh = %istio.name_any(),
        "reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::requeue(PERMANENT_FAILURE_INTERVAL)
    }
}
