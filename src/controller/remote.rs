//! RemoteIstio controller
//!
//! Keeps the peer registry in step with `RemoteIstio` resources. Peers are
//! connected from their kubeconfig secret and synced whenever their resource
//! changes. On deletion the mesh's objects are removed from the peer before
//! it is deregistered and its finalizer released.

use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, error, info, instrument, warn};

use crate::crd::{Condition, ConditionStatus, RemoteIstio, RemoteIstioStatus, SyncState};
use crate::defaults::set_remote_defaults;
use crate::remote::RemoteClusterStatus;
use crate::resources::MeshConfig;
use crate::{Error, Result};

use super::{has_finalizer, Context, PERMANENT_FAILURE_INTERVAL, RESYNC_INTERVAL, RETRY_INTERVAL};

/// CRD status for a peer's sync status
pub(crate) fn to_status(status: &RemoteClusterStatus) -> RemoteIstioStatus {
    let condition = match status.state {
        SyncState::Synced => {
            Condition::new("Synced", ConditionStatus::True, "Synced", "peer converged")
        }
        SyncState::Error => Condition::new(
            "Synced",
            ConditionStatus::False,
            "SyncFailed",
            status.message.clone().unwrap_or_default(),
        ),
        SyncState::Pending => Condition::new(
            "Synced",
            ConditionStatus::Unknown,
            "Pending",
            status.message.clone().unwrap_or_default(),
        ),
    };
    RemoteIstioStatus {
        state: status.state.clone(),
        last_synced_version: status.last_synced_version.clone(),
        message: status.message.clone(),
        conditions: vec![condition],
    }
}

fn status_with(state: SyncState, message: impl Into<String>) -> RemoteIstioStatus {
    to_status(&RemoteClusterStatus {
        state,
        last_synced_version: None,
        message: Some(message.into()),
    })
}

/// Reconcile one `RemoteIstio` resource
#[instrument(skip(remote, ctx), fields(cluster = %remote.name_any()))]
pub async fn reconcile(remote: Arc<RemoteIstio>, ctx: Arc<Context>) -> Result<Action> {
    let name = remote.name_any();
    let namespace = remote.namespace().unwrap_or_default();

    if remote.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&remote, &ctx).await;
    }
    if !has_finalizer(&remote.metadata) {
        ctx.kube.add_remote_finalizer(&namespace, &name).await?;
    }
    let previous = remote.status.as_ref();

    let mut resolved = (*remote).clone();
    set_remote_defaults(&mut resolved);

    let connected = match connect(&ctx, &namespace, &resolved).await {
        Ok(connected) => connected,
        Err(e) => {
            let status = status_with(SyncState::Error, e.to_string());
            record(&ctx, &namespace, &name, previous, status).await;
            return Err(e);
        }
    };
    if connected {
        info!("peer connected");
    }

    let Some(istio) = ctx.kube.get_mesh(&namespace).await? else {
        info!("no mesh in namespace yet");
        let message = format!("no Istio resource in namespace {namespace}");
        let status = status_with(SyncState::Pending, message);
        record(&ctx, &namespace, &name, previous, status).await;
        return Ok(Action::requeue(RETRY_INTERVAL));
    };
    let config = MeshConfig::from_istio(&istio)?;

    let result = ctx.remotes.sync(&config, &resolved).await;
    if let Some(status) = ctx.remotes.status(&name) {
        record(&ctx, &namespace, &name, previous, to_status(&status)).await;
    }
    result.map(|_| Action::requeue(RESYNC_INTERVAL))
}

/// Clean the peer, deregister it and release the finalizer
///
/// Cleanup is best effort: a peer that cannot be reached is still
/// deregistered.
async fn handle_deletion(remote: &RemoteIstio, ctx: &Context) -> Result<Action> {
    let name = remote.name_any();
    let namespace = remote.namespace().unwrap_or_default();

    if has_finalizer(&remote.metadata) && ctx.remotes.contains(&name) {
        match ctx.kube.get_mesh(&namespace).await {
            Ok(Some(istio)) => match MeshConfig::from_istio(&istio) {
                Ok(config) => match ctx.remotes.cleanup(&config, remote).await {
                    Ok(deleted) => info!(deleted, "peer cleaned up"),
                    Err(e) => warn!(error = %e, "peer cleanup failed"),
                },
                Err(e) => warn!(error = %e, "mesh unusable, skipping peer cleanup"),
            },
            Ok(None) => debug!("no mesh in namespace, nothing to clean up"),
            Err(e) => warn!(error = %e, "could not read mesh, skipping peer cleanup"),
        }
    }

    if ctx.remotes.remove(&name).await {
        info!("peer deregistered");
    }
    if has_finalizer(&remote.metadata) {
        ctx.kube.remove_remote_finalizer(&namespace, &name).await?;
    }
    Ok(Action::await_change())
}

async fn connect(ctx: &Context, namespace: &str, remote: &RemoteIstio) -> Result<bool> {
    let name = remote.name_any();
    let kubeconfig = ctx
        .kube
        .get_kubeconfig(namespace, &remote.kubeconfig_secret())
        .await
        .map_err(|e| Error::remote(&name, e.to_string()))?;
    ctx.remotes.add(&name, &kubeconfig).await
}

/// Patch a peer's status unless it already reads the same
///
/// Failures are logged; the peer's own outcome is what the caller reports.
pub(crate) async fn record(
    ctx: &Context,
    namespace: &str,
    name: &str,
    previous: Option<&RemoteIstioStatus>,
    status: RemoteIstioStatus,
) {
    let status = status.since(previous);
    if previous == Some(&status) {
        debug!(cluster = name, state = %status.state, "peer status unchanged");
        return;
    }
    if let Err(e) = ctx.kube.patch_remote_status(namespace, name, &status).await {
        warn!(cluster = name, error = %e, "failed to record peer status");
    }
}

/// Requeue policy for failed `RemoteIstio` passes
pub fn error_policy(remote: Arc<RemoteIstio>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %remote.name_any(),
        "remote reconciliation failed"
    );
    if error.is_retryable() {
        Action::requeue(RETRY_INTERVAL)
    } else {
        Action::requeue(PERMANENT_FAILURE_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{capturing_kube, context, StatusCapture};
    use super::*;
    use crate::crd::{Istio, IstioSpec, RemoteIstioSpec, FINALIZER};
    use crate::reconcile::{ClusterClient, MockClusterClient};
    use crate::remote::MockClusterConnector;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn peer(name: &str) -> Arc<RemoteIstio> {
        let mut remote = RemoteIstio::new(name, RemoteIstioSpec::default());
        remote.metadata.namespace = Some("istio-system".to_string());
        Arc::new(remote)
    }

    fn mesh() -> Istio {
        let mut istio = Istio::new("mesh", IstioSpec::default());
        istio.metadata.namespace = Some("istio-system".to_string());
        istio.metadata.uid = Some("6a1e4a4e-0000-4000-8000-000000000001".to_string());
        istio.metadata.resource_version = Some("7".to_string());
        istio
    }

    fn healthy() -> Arc<dyn ClusterClient> {
        let mut client = MockClusterClient::new();
        client.expect_get().returning(|_| Ok(None));
        client.expect_create().returning(|_, _| Ok(()));
        Arc::new(client)
    }

    fn connector() -> MockClusterConnector {
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().returning(|_, _| Ok(healthy()));
        connector
    }

    /// Story: a new peer is connected from its secret and synced
    #[tokio::test]
    async fn story_new_peer_connects_and_syncs() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_kubeconfig()
            .withf(|ns, secret| ns.to_string() == "istio-system" && secret.to_string() == "east")
            .returning(|_, _| Ok("apiVersion: v1".to_string()));
        kube.expect_get_mesh().returning(|_| Ok(Some(mesh())));
        let ctx = context(kube, healthy(), connector());

        let action = reconcile(peer("east"), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(RESYNC_INTERVAL));

        let status = capture.last_remote("east").unwrap();
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.last_synced_version.as_deref(), Some("7"));
        assert!(ctx.remotes.contains("east"));
        assert_eq!(*capture.finalizers.lock().unwrap(), vec!["add RemoteIstio east"]);
    }

    /// Story: a synced peer reconciled again leaves its status alone
    #[tokio::test]
    async fn story_synced_peer_writes_no_status() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_kubeconfig()
            .returning(|_, _| Ok("apiVersion: v1".to_string()));
        kube.expect_get_mesh().returning(|_| Ok(Some(mesh())));
        let ctx = context(kube, healthy(), connector());

        reconcile(peer("east"), ctx.clone()).await.unwrap();
        let writes = capture.remote.lock().unwrap().len();

        let mut synced = (*peer("east")).clone();
        synced.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        synced.status = capture.last_remote("east");
        reconcile(Arc::new(synced), ctx).await.unwrap();

        assert_eq!(capture.remote.lock().unwrap().len(), writes);
        assert_eq!(capture.finalizers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_secret_marks_peer_error() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_kubeconfig()
            .returning(|_, _| Err(Error::internal("secret not found")));
        let ctx = context(kube, healthy(), MockClusterConnector::new());

        let err = reconcile(peer("east"), ctx.clone()).await.unwrap_err();
        assert_eq!(err.cluster(), Some("east"));
        assert_eq!(capture.last_remote("east").unwrap().state, SyncState::Error);
        assert!(!ctx.remotes.contains("east"));
    }

    #[tokio::test]
    async fn test_peer_waits_for_mesh() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_kubeconfig()
            .returning(|_, _| Ok("apiVersion: v1".to_string()));
        kube.expect_get_mesh().returning(|_| Ok(None));
        let ctx = context(kube, healthy(), connector());

        let action = reconcile(peer("east"), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(RETRY_INTERVAL));
        assert_eq!(capture.last_remote("east").unwrap().state, SyncState::Pending);
    }

    #[tokio::test]
    async fn test_apply_failure_on_peer_is_recorded() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_kubeconfig()
            .returning(|_, _| Ok("apiVersion: v1".to_string()));
        kube.expect_get_mesh().returning(|_| Ok(Some(mesh())));
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().returning(|_, _| {
            let mut client = MockClusterClient::new();
            client
                .expect_get()
                .returning(|_| Err(Error::internal("forbidden")));
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });
        let ctx = context(kube, healthy(), connector);

        let err = reconcile(peer("east"), ctx).await.unwrap_err();
        assert_eq!(err.cluster(), Some("east"));
        let status = capture.last_remote("east").unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.conditions[0].reason, "SyncFailed");
    }

    fn deleting(name: &str) -> Arc<RemoteIstio> {
        let mut remote = (*peer(name)).clone();
        remote.metadata.finalizers = Some(vec![FINALIZER.to_string()]);
        remote.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        Arc::new(remote)
    }

    /// Story: deleting a peer removes the mesh's objects from it, then
    /// deregisters it and releases the finalizer
    #[tokio::test]
    async fn story_deleted_peer_is_cleaned_and_deregistered() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_mesh().returning(|_| Ok(Some(mesh())));
        let ctx = context(kube, healthy(), MockClusterConnector::new());

        let selectors = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = selectors.clone();
        let mut client = MockClusterClient::new();
        client.expect_delete_selected().returning(move |selection| {
            seen.lock().unwrap().push(selection.to_string());
            Ok(1)
        });
        ctx.remotes.add_client("east", Arc::new(client)).await;

        let action = reconcile(deleting("east"), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!ctx.remotes.contains("east"));

        let selectors = selectors.lock().unwrap();
        assert!(selectors
            .iter()
            .any(|s| s.starts_with("MutatingWebhookConfiguration (")));
        assert!(selectors
            .iter()
            .any(|s| s.starts_with("Deployment in istio-system (")));
        assert_eq!(
            *capture.finalizers.lock().unwrap(),
            vec!["remove RemoteIstio east"]
        );
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_still_released() {
        let capture = StatusCapture::default();
        let mut kube = capturing_kube(&capture);
        kube.expect_get_mesh().returning(|_| Ok(Some(mesh())));
        let ctx = context(kube, healthy(), MockClusterConnector::new());
        let mut client = MockClusterClient::new();
        client
            .expect_delete_selected()
            .returning(|_| Err(Error::internal("connection refused")));
        ctx.remotes.add_client("east", Arc::new(client)).await;

        let action = reconcile(deleting("east"), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!ctx.remotes.contains("east"));
        assert_eq!(
            *capture.finalizers.lock().unwrap(),
            vec!["remove RemoteIstio east"]
        );
    }

    #[tokio::test]
    async fn test_deleted_peer_without_finalizer_is_deregistered() {
        let capture = StatusCapture::default();
        let ctx = context(capturing_kube(&capture), healthy(), MockClusterConnector::new());
        ctx.remotes.add_client("east", healthy()).await;

        let mut remote = (*peer("east")).clone();
        remote.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let action = reconcile(Arc::new(remote), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(!ctx.remotes.contains("east"));
        assert!(capture.finalizers.lock().unwrap().is_empty());
    }

    #[test]
    fn test_status_conversion() {
        let status = to_status(&RemoteClusterStatus {
            state: SyncState::Synced,
            last_synced_version: Some("9".to_string()),
            message: None,
        });
        assert_eq!(status.state, SyncState::Synced);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }
}
