//! Peer cluster registry and replicated reconciliation
//!
//! Each registered peer gets its own client, sync status and operation lock.
//! Syncs of different peers never share a lock, so a slow or unreachable
//! peer cannot hold up its siblings or the local cluster. Registration
//! changes for a peer wait for that peer's in-flight sync to finish, and an
//! operation that was waiting on a peer which meanwhile went away fails
//! instead of touching it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::crd::{RemoteIstio, SyncState};
use crate::kube_utils::{
    client_from_kubeconfig, deterministic_hash, REMOTE_CONNECT_TIMEOUT, REMOTE_READ_TIMEOUT,
};
use crate::metrics::record_remote_sync;
use crate::reconcile::{ApplyReport, ClusterClient, KubeClusterClient, Ownership, ReconcileEngine};
use crate::resources::remote::{builders, remote_config};
use crate::resources::MeshConfig;
use crate::{Error, Result};

/// Last known sync outcome of a peer
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteClusterStatus {
    /// Sync state
    pub state: SyncState,
    /// Mesh resource version last converged on the peer
    pub last_synced_version: Option<String>,
    /// Error detail of the last failed sync
    pub message: Option<String>,
}

/// A registered peer cluster
pub struct RemoteCluster {
    name: String,
    client: Arc<dyn ClusterClient>,
    credentials: Option<String>,
    status: RwLock<RemoteClusterStatus>,
    op_lock: Mutex<()>,
}

impl RemoteCluster {
    fn new(name: String, client: Arc<dyn ClusterClient>, credentials: Option<String>) -> Self {
        Self {
            name,
            client,
            credentials,
            status: RwLock::new(RemoteClusterStatus::default()),
            op_lock: Mutex::new(()),
        }
    }

    /// Peer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the sync status
    pub fn status(&self) -> RemoteClusterStatus {
        match self.status.read() {
            Ok(status) => status.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_status(&self, update: impl FnOnce(&mut RemoteClusterStatus)) {
        match self.status.write() {
            Ok(mut status) => update(&mut status),
            Err(poisoned) => update(&mut poisoned.into_inner()),
        }
    }
}

/// Opens a client for a peer from its credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Connect to the named peer using kubeconfig YAML
    async fn connect(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ClusterClient>>;
}

/// Connector that builds kube clients with bounded timeouts
pub struct KubeconfigConnector;

#[async_trait]
impl ClusterConnector for KubeconfigConnector {
    async fn connect(&self, name: &str, kubeconfig: &str) -> Result<Arc<dyn ClusterClient>> {
        let client =
            client_from_kubeconfig(kubeconfig, REMOTE_CONNECT_TIMEOUT, REMOTE_READ_TIMEOUT)
                .await
                .map_err(|e| Error::remote(name, e.to_string()))?;
        Ok(Arc::new(KubeClusterClient::new(client)))
    }
}

/// Registry of peers and driver of their reduced pipeline
pub struct RemoteClusterManager {
    clusters: DashMap<String, Arc<RemoteCluster>>,
    engine: ReconcileEngine,
    connector: Arc<dyn ClusterConnector>,
}

impl RemoteClusterManager {
    /// Empty registry
    pub fn new(engine: ReconcileEngine, connector: Arc<dyn ClusterConnector>) -> Self {
        Self {
            clusters: DashMap::new(),
            engine,
            connector,
        }
    }

    /// Register a peer, connecting with its kubeconfig
    ///
    /// Returns false without reconnecting when the peer is already registered
    /// with the same kubeconfig. Otherwise the client is replaced once any
    /// in-flight sync of that peer has finished, and the status resets to
    /// Pending.
    pub async fn add(&self, name: &str, kubeconfig: &str) -> Result<bool> {
        let credentials = deterministic_hash(kubeconfig);
        if self
            .get(name)
            .is_some_and(|c| c.credentials.as_deref() == Some(credentials.as_str()))
        {
            return Ok(false);
        }
        let client = self.connector.connect(name, kubeconfig).await?;
        self.register(name, client, Some(credentials)).await;
        Ok(true)
    }

    /// Register a peer with an existing client
    pub async fn add_client(&self, name: &str, client: Arc<dyn ClusterClient>) {
        self.register(name, client, None).await;
    }

    async fn register(
        &self,
        name: &str,
        client: Arc<dyn ClusterClient>,
        credentials: Option<String>,
    ) {
        let previous = self.get(name);
        let _guard = match &previous {
            Some(cluster) => Some(cluster.op_lock.lock().await),
            None => None,
        };
        self.clusters.insert(
            name.to_string(),
            Arc::new(RemoteCluster::new(name.to_string(), client, credentials)),
        );
        info!(cluster = name, "remote cluster registered");
    }

    /// Deregister a peer, returning whether it was known
    pub async fn remove(&self, name: &str) -> bool {
        let Some(cluster) = self.get(name) else {
            return false;
        };
        let _guard = cluster.op_lock.lock().await;
        let removed = self
            .clusters
            .remove_if(name, |_, current| Arc::ptr_eq(current, &cluster))
            .is_some();
        if removed {
            info!(cluster = name, "remote cluster deregistered");
        }
        removed
    }

    fn get(&self, name: &str) -> Option<Arc<RemoteCluster>> {
        self.clusters.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether `cluster` is still the registered entry for `name`
    fn is_current(&self, name: &str, cluster: &Arc<RemoteCluster>) -> bool {
        self.get(name).is_some_and(|current| Arc::ptr_eq(&current, cluster))
    }

    /// Whether a peer is registered
    pub fn contains(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    /// Sync status of a peer
    pub fn status(&self, name: &str) -> Option<RemoteClusterStatus> {
        self.get(name).map(|c| c.status())
    }

    /// Registered peer names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// True when no peer is registered
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Run the reduced pipeline against one peer
    ///
    /// Only this peer's status changes. Failures come back as
    /// [`Error::RemoteConnectivity`] naming the peer.
    #[instrument(skip_all, fields(cluster = %remote.name_any()))]
    pub async fn sync(&self, local: &MeshConfig, remote: &RemoteIstio) -> Result<ApplyReport> {
        let name = remote.name_any();
        let cluster = self
            .get(&name)
            .ok_or_else(|| Error::remote(&name, "cluster is not registered"))?;
        let _guard = cluster.op_lock.lock().await;
        if !self.is_current(&name, &cluster) {
            return Err(Error::remote(&name, "cluster was deregistered during sync"));
        }

        let config = remote_config(local, remote);
        let result = self
            .engine
            .apply_components(
                cluster.client.as_ref(),
                &config,
                &builders(remote),
                &Ownership::label(&config),
            )
            .await;

        record_remote_sync(&name, result.is_ok());
        match result {
            Ok(report) => {
                cluster.set_status(|status| {
                    status.state = SyncState::Synced;
                    status.last_synced_version = local.resource_version.clone();
                    status.message = None;
                });
                info!(changes = report.changes(), "remote cluster synced");
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "remote cluster sync failed");
                cluster.set_status(|status| {
                    status.state = SyncState::Error;
                    status.message = Some(e.to_string());
                });
                Err(Error::remote(&name, e.to_string()))
            }
        }
    }

    /// Delete everything the mesh applied on one peer
    ///
    /// Returns the number of objects deleted. The peer stays registered.
    #[instrument(skip_all, fields(cluster = %remote.name_any()))]
    pub async fn cleanup(&self, local: &MeshConfig, remote: &RemoteIstio) -> Result<usize> {
        let name = remote.name_any();
        let cluster = self
            .get(&name)
            .ok_or_else(|| Error::remote(&name, "cluster is not registered"))?;
        let _guard = cluster.op_lock.lock().await;
        if !self.is_current(&name, &cluster) {
            return Err(Error::remote(&name, "cluster was deregistered during cleanup"));
        }

        let config = remote_config(local, remote);
        let deleted = self
            .engine
            .delete_owned(
                cluster.client.as_ref(),
                &Ownership::label(&config),
                &config.namespace,
            )
            .await
            .map_err(|e| Error::remote(&name, e.to_string()))?;
        info!(deleted, "remote cluster cleaned up");
        Ok(deleted)
    }

    /// Clean up every given peer that is registered, concurrently
    pub async fn cleanup_all(
        &self,
        local: &MeshConfig,
        remotes: &[RemoteIstio],
    ) -> BTreeMap<String, Result<usize>> {
        let registered = remotes.iter().filter(|r| self.contains(&r.name_any()));
        let results = join_all(registered.map(|remote| async move {
            (remote.name_any(), self.cleanup(local, remote).await)
        }))
        .await;
        results.into_iter().collect()
    }

    /// Sync every given peer concurrently, returning each outcome by name
    pub async fn sync_all(
        &self,
        local: &MeshConfig,
        remotes: &[RemoteIstio],
    ) -> BTreeMap<String, Result<ApplyReport>> {
        let results = join_all(remotes.iter().map(|remote| async move {
            (remote.name_any(), self.sync(local, remote).await)
        }))
        .await;
        results.into_iter().collect()
    }
}
