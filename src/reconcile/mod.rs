//! Convergence of desired objects against a cluster
//!
//! The engine walks a [`DesiredObjectSet`] in order. For each object it
//! attaches ownership, then creates it when absent, updates it when the live
//! copy was applied from different content, and leaves it alone otherwise.
//! Processing is not transactional: the first failure stops the pass and
//! nothing already applied is rolled back.
//!
//! Teardown goes the other way: objects carrying a mesh's owner label are
//! found by label selector and deleted kind by kind.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::kube_utils::{build_api_resource, deterministic_hash};
use crate::metrics::{record_apply, ApplyOperation};
use crate::resources::{
    is_namespaced_kind, ComponentBuilder, DesiredObject, DesiredObjectSet, MeshConfig,
};
use crate::{Error, Result};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "mesh-operator";

/// Annotation carrying the hash of the content last applied by the engine
pub const LAST_APPLIED_ANNOTATION: &str = "istio.banzaicloud.io/last-applied-hash";

/// Label naming the owning mesh by UID
pub const OWNER_LABEL: &str = "istio.banzaicloud.io/owner-uid";

/// Default bound on a single cluster call
pub const DEFAULT_APPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity of one object in a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// apiVersion, e.g. `apps/v1`
    pub api_version: String,
    /// Kind, e.g. `Deployment`
    pub kind: String,
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ObjectKey {
    /// Key of a desired object
    pub fn of(object: &DesiredObject) -> Self {
        Self {
            api_version: object.api_version().to_string(),
            kind: object.kind().to_string(),
            name: object.name().to_string(),
            namespace: object.namespace().map(str::to_string),
        }
    }

    fn apply_error(&self, message: impl Into<String>) -> Error {
        Error::apply(
            &self.kind,
            &self.name,
            self.namespace.clone().unwrap_or_default(),
            message,
        )
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Objects of one kind matching a label selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LabelSelection {
    /// apiVersion of the kind
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Namespace searched, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Label selector, e.g. `key=value`
    pub selector: String,
}

impl LabelSelection {
    fn apply_error(&self, message: impl Into<String>) -> Error {
        Error::apply(
            &self.kind,
            format!("selector {}", self.selector),
            self.namespace.clone().unwrap_or_default(),
            message,
        )
    }

    /// Whether an object carries every `key=value` pair of the selector
    pub fn matches(&self, object: &Value) -> bool {
        let labels = object.pointer("/metadata/labels");
        self.selector.split(',').all(|pair| match pair.split_once('=') {
            Some((key, value)) => {
                labels.and_then(|l| l.get(key)).and_then(Value::as_str) == Some(value)
            }
            None => false,
        })
    }
}

impl fmt::Display for LabelSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} in {} ({})", self.kind, ns, self.selector),
            None => write!(f, "{} ({})", self.kind, self.selector),
        }
    }
}

/// Create/read/update/delete primitive against one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Live object as JSON, `None` when absent
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>>;

    /// Create an object that does not exist yet
    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<()>;

    /// Bring an existing object to the given content
    async fn update(&self, key: &ObjectKey, object: &Value) -> Result<()>;

    /// Delete every object in the selection, returning how many went away
    async fn delete_selected(&self, selection: &LabelSelection) -> Result<usize>;
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = build_api_resource(api_version, kind);
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn object_api(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(&key.api_version, &key.kind, key.namespace.as_deref())
    }

    /// Server-side apply under the operator's field manager
    async fn apply(&self, key: &ObjectKey, object: &Value) -> Result<()> {
        self.object_api(key)
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(object),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Value>> {
        let live = self.object_api(key).get_opt(&key.name).await?;
        Ok(live.map(serde_json::to_value).transpose()?)
    }

    async fn create(&self, key: &ObjectKey, object: &Value) -> Result<()> {
        self.apply(key, object).await
    }

    async fn update(&self, key: &ObjectKey, object: &Value) -> Result<()> {
        self.apply(key, object).await
    }

    async fn delete_selected(&self, selection: &LabelSelection) -> Result<usize> {
        let api = self.api(
            &selection.api_version,
            &selection.kind,
            selection.namespace.as_deref(),
        );
        let listed = api
            .list(&ListParams::default().labels(&selection.selector))
            .await?;
        let mut deleted = 0;
        for object in listed.items {
            match api.delete(&object.name_any(), &DeleteParams::background()).await {
                Ok(_) => deleted += 1,
                Err(kube::Error::Api(resp)) if resp.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }
}

/// How applied objects are tied to their mesh
#[derive(Clone, Debug, PartialEq)]
pub enum Ownership {
    /// Controller owner reference on namespaced objects, for garbage
    /// collection in the mesh's own cluster. Every object also gets the
    /// owner label, since cluster-scoped kinds cannot reference a
    /// namespaced owner.
    Controller(OwnerReference),
    /// Label only, for peers where the owner does not exist
    Label {
        /// Label key
        key: String,
        /// Label value
        value: String,
    },
}

impl Ownership {
    /// Label selector matching every object this ownership was assigned to
    pub fn selector(&self) -> String {
        match self {
            Self::Controller(owner) => format!("{OWNER_LABEL}={}", owner.uid),
            Self::Label { key, value } => format!("{key}={value}"),
        }
    }

    /// Owner reference ownership for objects in the mesh's own cluster
    pub fn controller(config: &MeshConfig) -> Self {
        Self::Controller(OwnerReference {
            api_version: config.owner_api_version(),
            kind: config.owner_kind(),
            name: config.name.clone(),
            uid: config.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }

    /// Label ownership for objects on a peer
    pub fn label(config: &MeshConfig) -> Self {
        Self::Label {
            key: OWNER_LABEL.to_string(),
            value: config.uid.clone(),
        }
    }

    /// Attach ownership to an object
    pub fn assign(&self, object: &mut DesiredObject) {
        let namespaced = object.is_namespaced();
        let meta = object.meta_mut();
        let (key, value) = match self {
            Self::Controller(owner) => {
                if namespaced {
                    meta.owner_references = Some(vec![owner.clone()]);
                }
                (OWNER_LABEL, owner.uid.as_str())
            }
            Self::Label { key, value } => (key.as_str(), value.as_str()),
        };
        meta.labels
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
    }
}

/// Counts of what one pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Objects created
    pub created: usize,
    /// Objects updated
    pub updated: usize,
    /// Objects already converged
    pub unchanged: usize,
}

impl ApplyReport {
    fn record(&mut self, operation: ApplyOperation) {
        match operation {
            ApplyOperation::Created => self.created += 1,
            ApplyOperation::Updated => self.updated += 1,
            ApplyOperation::Unchanged => self.unchanged += 1,
        }
    }

    /// Number of create or update calls issued
    pub fn changes(&self) -> usize {
        self.created + self.updated
    }

    /// Sum of two reports
    pub fn merge(self, other: Self) -> Self {
        Self {
            created: self.created + other.created,
            updated: self.updated + other.updated,
            unchanged: self.unchanged + other.unchanged,
        }
    }
}

/// Engine settings
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Bound on each get, create or update call
    pub apply_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            apply_timeout: DEFAULT_APPLY_TIMEOUT,
        }
    }
}

/// Stateless convergence engine shared by the local and peer pipelines
#[derive(Clone, Debug)]
pub struct ReconcileEngine {
    config: EngineConfig,
    cancel: CancellationToken,
}

impl ReconcileEngine {
    /// Engine whose calls are aborted once `cancel` fires
    pub fn new(config: EngineConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    /// Run one cluster call under the timeout and the shutdown token
    ///
    /// `fail` turns a failure message into the error reported for the call.
    async fn call<T>(
        &self,
        fail: impl FnOnce(String) -> Error,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(fail("reconciliation cancelled".to_string())),
            res = tokio::time::timeout(self.config.apply_timeout, fut) => match res {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(fail(e.to_string())),
                Err(_) => Err(fail(format!(
                    "timed out after {}s",
                    self.config.apply_timeout.as_secs()
                ))),
            },
        }
    }

    /// Converge one object set, in order, stopping at the first failure
    #[instrument(skip_all, fields(component = %set.component))]
    pub async fn apply_set(
        &self,
        client: &dyn ClusterClient,
        set: &DesiredObjectSet,
        ownership: &Ownership,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        for desired in &set.objects {
            let operation = self.apply_object(client, desired, ownership).await?;
            record_apply(operation);
            report.record(operation);
        }
        debug!(
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            "component converged"
        );
        Ok(report)
    }

    async fn apply_object(
        &self,
        client: &dyn ClusterClient,
        desired: &DesiredObject,
        ownership: &Ownership,
    ) -> Result<ApplyOperation> {
        let mut object = desired.clone();
        ownership.assign(&mut object);
        let key = ObjectKey::of(&object);

        let hash = deterministic_hash(&object.to_value()?.to_string());
        object
            .meta_mut()
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LAST_APPLIED_ANNOTATION.to_string(), hash.clone());
        let body = object.to_value()?;

        let fail = |message: String| key.apply_error(message);
        let operation = match self.call(fail, client.get(&key)).await? {
            None => {
                self.call(fail, client.create(&key, &body)).await?;
                ApplyOperation::Created
            }
            Some(live) if applied_hash(&live) == Some(hash.as_str()) => ApplyOperation::Unchanged,
            Some(_) => {
                self.call(fail, client.update(&key, &body)).await?;
                ApplyOperation::Updated
            }
        };
        if operation != ApplyOperation::Unchanged {
            info!(object = %key, operation = operation.as_str(), "applied");
        }
        Ok(operation)
    }

    /// Build and converge every enabled component, in order
    ///
    /// Disabled components are skipped. The first component failure ends the
    /// pass.
    pub async fn apply_components(
        &self,
        client: &dyn ClusterClient,
        config: &MeshConfig,
        builders: &[Box<dyn ComponentBuilder>],
        ownership: &Ownership,
    ) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        for builder in builders {
            if !builder.enabled(config) {
                debug!(component = builder.name(), "component disabled");
                continue;
            }
            let set = builder.build(config)?;
            report = report.merge(self.apply_set(client, &set, ownership).await?);
        }
        Ok(report)
    }

    /// Delete what the engine applied under `ownership`
    ///
    /// Webhook configurations go first so admission stops before the
    /// serving workloads disappear. Controller ownership only removes
    /// cluster-scoped kinds; namespaced objects carry an owner reference and
    /// are collected with their owner. Label ownership removes every managed
    /// kind in `namespace` and across the cluster.
    #[instrument(skip_all, fields(selector = %ownership.selector()))]
    pub async fn delete_owned(
        &self,
        client: &dyn ClusterClient,
        ownership: &Ownership,
        namespace: &str,
    ) -> Result<usize> {
        let collected = matches!(ownership, Ownership::Controller(_));
        let mut deleted = 0;
        for (api_version, kind) in DesiredObject::kinds().into_iter().rev() {
            let namespaced = is_namespaced_kind(kind);
            if namespaced && collected {
                continue;
            }
            let selection = LabelSelection {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                namespace: namespaced.then(|| namespace.to_string()),
                selector: ownership.selector(),
            };
            let count = self
                .call(
                    |message| selection.apply_error(message),
                    client.delete_selected(&selection),
                )
                .await?;
            if count > 0 {
                info!(objects = %selection, count, "deleted");
            }
            deleted += count;
        }
        Ok(deleted)
    }
}

fn applied_hash(live: &Value) -> Option<&str> {
    live.pointer("/metadata/annotations")
        .and_then(|a| a.get(LAST_APPLIED_ANNOTATION))
        .and_then(Value::as_str)
}
