//! Controllers for mesh CRDs
//!
//! The `Istio` controller converges the local control plane and then fans
//! out to every registered peer. The `RemoteIstio` controller keeps the peer
//! registry in step with the `RemoteIstio` resources and syncs a single peer
//! whenever its resource changes.
//!
//! Both resources carry [`FINALIZER`] so deletion waits for cleanup: owner
//! references cannot reach cluster-scoped objects or objects on peers.

mod istio;
mod remote;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;

use crate::crd::{
    Istio, IstioStatus, RemoteIstio, RemoteIstioStatus, FINALIZER, KUBECONFIG_SECRET_KEY,
};
use crate::reconcile::{
    ClusterClient, EngineConfig, KubeClusterClient, ReconcileEngine, FIELD_MANAGER,
};
use crate::remote::{KubeconfigConnector, RemoteClusterManager};
use crate::resources::rendered::RenderedComponent;
use crate::{Error, Result};

pub use istio::{error_policy, reconcile};
pub use remote::{error_policy as remote_error_policy, reconcile as reconcile_remote};

/// Requeue interval after a successful pass, to correct drift
pub const RESYNC_INTERVAL: Duration = Duration::from_secs(300);

/// Requeue interval after a retryable failure
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Requeue interval after a failure that needs a spec change
pub const PERMANENT_FAILURE_INTERVAL: Duration = Duration::from_secs(300);

/// Kubernetes reads and status writes needed by the controllers
///
/// Abstracted so the controllers can be exercised without an API server.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Patch the status of an `Istio`
    async fn patch_istio_status(
        &self,
        namespace: &str,
        name: &str,
        status: &IstioStatus,
    ) -> Result<()>;

    /// Patch the status of a `RemoteIstio`
    async fn patch_remote_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteIstioStatus,
    ) -> Result<()>;

    /// Read the kubeconfig stored in a secret
    async fn get_kubeconfig(&self, namespace: &str, secret: &str) -> Result<String>;

    /// Every `RemoteIstio` in a namespace
    async fn list_remotes(&self, namespace: &str) -> Result<Vec<RemoteIstio>>;

    /// The `Istio` of a namespace, if any
    async fn get_mesh(&self, namespace: &str) -> Result<Option<Istio>>;

    /// Add [`FINALIZER`] to an `Istio`
    async fn add_istio_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove [`FINALIZER`] from an `Istio`
    async fn remove_istio_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Add [`FINALIZER`] to a `RemoteIstio`
    async fn add_remote_finalizer(&self, namespace: &str, name: &str) -> Result<()>;

    /// Remove [`FINALIZER`] from a `RemoteIstio`
    async fn remove_remote_finalizer(&self, namespace: &str, name: &str) -> Result<()>;
}

/// Whether an object carries [`FINALIZER`]
pub(crate) fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == FINALIZER))
}

/// [`KubeClient`] backed by the Kubernetes API
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Rewrite the finalizer list of a namespaced object
    ///
    /// `edit` returns false when the list is already as wanted, in which case
    /// nothing is written.
    async fn edit_finalizers<K>(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let object = api.get(name).await?;
        let mut finalizers = object.meta().finalizers.clone().unwrap_or_default();
        if !edit(&mut finalizers) {
            return Ok(());
        }
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

fn insert_finalizer(finalizers: &mut Vec<String>) -> bool {
    if finalizers.iter().any(|f| f == FINALIZER) {
        return false;
    }
    finalizers.push(FINALIZER.to_string());
    true
}

fn drop_finalizer(finalizers: &mut Vec<String>) -> bool {
    let before = finalizers.len();
    finalizers.retain(|f| f != FINALIZER);
    finalizers.len() != before
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn patch_istio_status(
        &self,
        namespace: &str,
        name: &str,
        status: &IstioStatus,
    ) -> Result<()> {
        let api: Api<Istio> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_remote_status(
        &self,
        namespace: &str,
        name: &str,
        status: &RemoteIstioStatus,
    ) -> Result<()> {
        let api: Api<RemoteIstio> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_kubeconfig(&self, namespace: &str, secret: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret_obj = api.get(secret).await?;
        let bytes = secret_obj
            .data
            .and_then(|mut data| data.remove(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "kubeconfig",
                    format!("secret {namespace}/{secret} has no {KUBECONFIG_SECRET_KEY} key"),
                )
            })?;
        String::from_utf8(bytes.0).map_err(|e| {
            Error::internal_with_context(
                "kubeconfig",
                format!("secret {namespace}/{secret} is not valid UTF-8: {e}"),
            )
        })
    }

    async fn list_remotes(&self, namespace: &str) -> Result<Vec<RemoteIstio>> {
        let api: Api<RemoteIstio> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_mesh(&self, namespace: &str) -> Result<Option<Istio>> {
        let api: Api<Istio> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items.into_iter().next())
    }

    async fn add_istio_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        self.edit_finalizers::<Istio>(namespace, name, insert_finalizer)
            .await
    }

    async fn remove_istio_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        self.edit_finalizers::<Istio>(namespace, name, drop_finalizer)
            .await
    }

    async fn add_remote_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        self.edit_finalizers::<RemoteIstio>(namespace, name, insert_finalizer)
            .await
    }

    async fn remove_remote_finalizer(&self, namespace: &str, name: &str) -> Result<()> {
        self.edit_finalizers::<RemoteIstio>(namespace, name, drop_finalizer)
            .await
    }
}

/// Shared state for both controllers
pub struct Context {
    /// Status writes and lookups
    pub kube: Arc<dyn KubeClient>,
    /// Apply target for the local cluster
    pub cluster: Arc<dyn ClusterClient>,
    /// Convergence engine
    pub engine: ReconcileEngine,
    /// Peer registry
    pub remotes: Arc<RemoteClusterManager>,
    /// Pre-rendered components applied ahead of the built-in ones
    pub rendered: Vec<RenderedComponent>,
}

impl Context {
    /// Context talking to the cluster behind `client`
    ///
    /// Every apply call is aborted once `cancel` fires.
    pub fn new(
        client: Client,
        engine_config: EngineConfig,
        cancel: CancellationToken,
        rendered: Vec<RenderedComponent>,
    ) -> Self {
        let engine = ReconcileEngine::new(engine_config, cancel);
        Self {
            kube: Arc::new(KubeClientImpl::new(client.clone())),
            cluster: Arc::new(KubeClusterClient::new(client)),
            remotes: Arc::new(RemoteClusterManager::new(
                engine.clone(),
                Arc::new(KubeconfigConnector),
            )),
            engine,
            rendered,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;
    use crate::remote::MockClusterConnector;

    /// Status and finalizer writes captured for assertions
    #[derive(Clone, Default)]
    pub struct StatusCapture {
        pub istio: Arc<Mutex<Vec<IstioStatus>>>,
        pub remote: Arc<Mutex<Vec<(String, RemoteIstioStatus)>>>,
        /// Entries like `add Istio mesh` or `remove RemoteIstio east`
        pub finalizers: Arc<Mutex<Vec<String>>>,
    }

    impl StatusCapture {
        pub fn last_istio(&self) -> Option<IstioStatus> {
            self.istio.lock().unwrap().last().cloned()
        }

        pub fn last_remote(&self, name: &str) -> Option<RemoteIstioStatus> {
            self.remote
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, s)| s.clone())
        }
    }

    /// Kube mock that records status patches
    pub fn capturing_kube(capture: &StatusCapture) -> MockKubeClient {
        let mut kube = MockKubeClient::new();
        let istio = capture.istio.clone();
        kube.expect_patch_istio_status()
            .returning(move |_, _, status| {
                istio.lock().unwrap().push(status.clone());
                Ok(())
            });
        let remote = capture.remote.clone();
        kube.expect_patch_remote_status()
            .returning(move |_, name, status| {
                remote.lock().unwrap().push((name.to_string(), status.clone()));
                Ok(())
            });

        let log = capture.finalizers.clone();
        kube.expect_add_istio_finalizer().returning(move |_, name| {
            log.lock().unwrap().push(format!("add Istio {name}"));
            Ok(())
        });
        let log = capture.finalizers.clone();
        kube.expect_remove_istio_finalizer().returning(move |_, name| {
            log.lock().unwrap().push(format!("remove Istio {name}"));
            Ok(())
        });
        let log = capture.finalizers.clone();
        kube.expect_add_remote_finalizer().returning(move |_, name| {
            log.lock().unwrap().push(format!("add RemoteIstio {name}"));
            Ok(())
        });
        let log = capture.finalizers.clone();
        kube.expect_remove_remote_finalizer().returning(move |_, name| {
            log.lock().unwrap().push(format!("remove RemoteIstio {name}"));
            Ok(())
        });
        kube
    }

    pub fn context(
        kube: MockKubeClient,
        cluster: Arc<dyn ClusterClient>,
        connector: MockClusterConnector,
    ) -> Arc<Context> {
        let engine = ReconcileEngine::new(EngineConfig::default(), CancellationToken::new());
        Arc::new(Context {
            kube: Arc::new(kube),
            cluster,
            remotes: Arc::new(RemoteClusterManager::new(engine.clone(), Arc::new(connector))),
            engine,
            rendered: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalizer_edits_are_idempotent() {
        let mut finalizers = vec!["other.io/hold".to_string()];
        assert!(insert_finalizer(&mut finalizers));
        assert!(!insert_finalizer(&mut finalizers));
        assert_eq!(finalizers, vec!["other.io/hold".to_string(), FINALIZER.to_string()]);

        assert!(drop_finalizer(&mut finalizers));
        assert!(!drop_finalizer(&mut finalizers));
        assert_eq!(finalizers, vec!["other.io/hold".to_string()]);
    }

    #[test]
    fn test_has_finalizer() {
        let mut meta = ObjectMeta::default();
        assert!(!has_finalizer(&meta));
        meta.finalizers = Some(vec![FINALIZER.to_string()]);
        assert!(has_finalizer(&meta));
    }
}
