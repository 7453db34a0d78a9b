//! Desired-state builders for mesh components
//!
//! Each component maps a resolved [`MeshConfig`] to an ordered
//! [`DesiredObjectSet`]. Builders are pure: they never talk to a cluster.

pub mod citadel;
pub mod coredns;
pub mod galley;
pub mod gateways;
pub mod mesh;
pub mod mixer;
pub mod node_agent;
pub mod pilot;
pub mod remote;
pub mod rendered;
pub mod sidecar_injector;
pub mod templates;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use kube::{Resource, ResourceExt};
use serde_json::Value;

use crate::crd::{Istio, IstioSpec};
use crate::defaults;
use crate::{Error, Result};

pub use rendered::RenderedComponent;

macro_rules! desired_objects {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        /// A Kubernetes object the mesh wants to exist, over the closed set
        /// of kinds the operator manages
        #[derive(Clone, Debug, PartialEq)]
        #[allow(clippy::large_enum_variant)]
        pub enum DesiredObject {
            $(
                #[doc = concat!("A `", stringify!($variant), "`")]
                $variant($ty),
            )+
        }

        impl DesiredObject {
            /// Every managed kind as `(apiVersion, kind)`, in declaration order
            pub fn kinds() -> Vec<(&'static str, &'static str)> {
                vec![$((
                    <$ty as k8s_openapi::Resource>::API_VERSION,
                    <$ty as k8s_openapi::Resource>::KIND,
                ),)+]
            }

            /// Kind of the wrapped object
            pub fn kind(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => <$ty as k8s_openapi::Resource>::KIND,)+
                }
            }

            /// apiVersion of the wrapped object
            pub fn api_version(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => <$ty as k8s_openapi::Resource>::API_VERSION,)+
                }
            }

            /// Object metadata
            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Self::$variant(o) => o.metadata(),)+
                }
            }

            /// Mutable object metadata
            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Self::$variant(o) => o.metadata_mut(),)+
                }
            }

            /// Serialize to JSON, including apiVersion and kind
            pub fn to_value(&self) -> Result<Value> {
                let value = match self {
                    $(Self::$variant(o) => serde_json::to_value(o),)+
                };
                value.map_err(|e| Error::serialization_for_kind(self.kind(), e.to_string()))
            }

            /// Decode a rendered manifest into a supported kind
            pub fn from_value(value: Value) -> Result<Self> {
                let kind = value
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if kind.is_empty() {
                    return Err(Error::decode(rendered::COMPONENT, "manifest has no kind"));
                }
                $(
                    if kind == <$ty as k8s_openapi::Resource>::KIND {
                        return serde_json::from_value::<$ty>(value)
                            .map(Self::$variant)
                            .map_err(|e| Error::decode_kind(rendered::COMPONENT, kind, e.to_string()));
                    }
                )+
                Err(Error::decode_kind(
                    rendered::COMPONENT,
                    kind.clone(),
                    format!("unsupported kind {kind}"),
                ))
            }
        }

        $(
            impl From<$ty> for DesiredObject {
                fn from(o: $ty) -> Self {
                    Self::$variant(o)
                }
            }
        )+
    };
}

desired_objects! {
    ServiceAccount => ServiceAccount,
    ConfigMap => ConfigMap,
    Service => Service,
    Endpoints => Endpoints,
    Deployment => Deployment,
    DaemonSet => DaemonSet,
    HorizontalPodAutoscaler => HorizontalPodAutoscaler,
    PodDisruptionBudget => PodDisruptionBudget,
    Role => Role,
    RoleBinding => RoleBinding,
    ClusterRole => ClusterRole,
    ClusterRoleBinding => ClusterRoleBinding,
    MutatingWebhookConfiguration => MutatingWebhookConfiguration,
    ValidatingWebhookConfiguration => ValidatingWebhookConfiguration,
}

/// Whether a managed kind lives in a namespace
pub fn is_namespaced_kind(kind: &str) -> bool {
    !matches!(
        kind,
        "ClusterRole"
            | "ClusterRoleBinding"
            | "MutatingWebhookConfiguration"
            | "ValidatingWebhookConfiguration"
    )
}

impl DesiredObject {
    /// Whether the kind lives in a namespace
    pub fn is_namespaced(&self) -> bool {
        is_namespaced_kind(self.kind())
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    /// Object namespace, `None` for cluster-scoped kinds
    pub fn namespace(&self) -> Option<&str> {
        self.meta().namespace.as_deref()
    }
}

/// Ordered objects produced by one component
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DesiredObjectSet {
    /// Producing component
    pub component: String,
    /// Objects in apply order
    pub objects: Vec<DesiredObject>,
}

impl DesiredObjectSet {
    /// Empty set for a component
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            objects: Vec::new(),
        }
    }

    /// Append an object
    pub fn push(&mut self, object: impl Into<DesiredObject>) {
        self.objects.push(object.into());
    }

    /// Builder-style append
    pub fn with(mut self, object: impl Into<DesiredObject>) -> Self {
        self.push(object);
        self
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// True when the set holds nothing
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Find an object by kind and name
    pub fn find(&self, kind: &str, name: &str) -> Option<&DesiredObject> {
        self.objects
            .iter()
            .find(|o| o.kind() == kind && o.name() == name)
    }
}

/// Resolved configuration of one mesh, together with the identity of the
/// `Istio` resource that owns everything built from it
#[derive(Clone, Debug, PartialEq)]
pub struct MeshConfig {
    /// Name of the owning `Istio`
    pub name: String,
    /// Namespace of the owning `Istio`; every namespaced object lands here
    pub namespace: String,
    /// UID of the owning `Istio`
    pub uid: String,
    /// Resource version the config was resolved from
    pub resource_version: Option<String>,
    /// Fully defaulted spec
    pub spec: IstioSpec,
    /// Built for a peer cluster rather than the local one
    pub remote: bool,
}

impl MeshConfig {
    /// Resolve an `Istio` resource into a config
    pub fn from_istio(istio: &Istio) -> Result<Self> {
        let namespace = istio
            .namespace()
            .ok_or_else(|| Error::config("istio", "Istio resource has no namespace"))?;
        let uid = istio
            .uid()
            .ok_or_else(|| Error::config("istio", "Istio resource has no uid"))?;
        Ok(Self {
            name: istio.name_any(),
            spec: defaults::resolve(&istio.spec, &namespace),
            namespace,
            uid,
            resource_version: istio.resource_version(),
            remote: false,
        })
    }

    /// apiVersion of the owning resource
    pub fn owner_api_version(&self) -> String {
        Istio::api_version(&()).to_string()
    }

    /// Kind of the owning resource
    pub fn owner_kind(&self) -> String {
        Istio::kind(&()).to_string()
    }
}

/// One mesh component's mapping from config to desired objects
pub trait ComponentBuilder: Send + Sync {
    /// Component name used in logs and errors
    fn name(&self) -> &str;

    /// Whether the component should exist for this config
    fn enabled(&self, config: &MeshConfig) -> bool;

    /// Desired objects in apply order
    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet>;
}

/// Every builder for a mesh, in apply order
///
/// Rendered components come first, then the mesh ConfigMap, the control
/// plane, gateways, injection, and the optional node-level and DNS
/// components.
pub fn builders(
    config: &MeshConfig,
    rendered: &[RenderedComponent],
) -> Vec<Box<dyn ComponentBuilder>> {
    let mut out: Vec<Box<dyn ComponentBuilder>> = rendered
        .iter()
        .cloned()
        .map(|r| Box::new(r) as Box<dyn ComponentBuilder>)
        .collect();
    out.push(Box::new(mesh::MeshConfigBuilder::new(rendered)));
    out.push(Box::new(citadel::CitadelBuilder));
    out.push(Box::new(galley::GalleyBuilder));
    out.push(Box::new(pilot::PilotBuilder));
    out.push(Box::new(mixer::MixerBuilder));
    for name in config.spec.gateways.configs.keys() {
        out.push(Box::new(gateways::GatewayBuilder::new(name.clone())));
    }
    out.push(Box::new(sidecar_injector::SidecarInjectorBuilder));
    out.push(Box::new(node_agent::NodeAgentBuilder));
    out.push(Box::new(coredns::CoreDnsBuilder));
    out
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use kube::api::ObjectMeta as KubeMeta;

    #[test]
    fn test_kind_and_scope() {
        let sa = DesiredObject::from(ServiceAccount::default());
        assert_eq!(sa.kind(), "ServiceAccount");
        assert_eq!(sa.api_version(), "v1");
        assert!(sa.is_namespaced());

        let crb = DesiredObject::from(ClusterRoleBinding::default());
        assert_eq!(crb.api_version(), "rbac.authorization.k8s.io/v1");
        assert!(!crb.is_namespaced());
    }

    #[test]
    fn test_cluster_scoped_kinds() {
        let cluster_scoped: Vec<&str> = DesiredObject::kinds()
            .into_iter()
            .filter(|(_, kind)| !is_namespaced_kind(kind))
            .map(|(_, kind)| kind)
            .collect();
        assert_eq!(
            cluster_scoped,
            vec![
                "ClusterRole",
                "ClusterRoleBinding",
                "MutatingWebhookConfiguration",
                "ValidatingWebhookConfiguration",
            ]
        );
    }

    #[test]
    fn test_to_value_includes_type_meta() {
        let mut sa = ServiceAccount::default();
        sa.metadata.name = Some("istio-pilot-service-account".to_string());
        let value = DesiredObject::from(sa).to_value().unwrap();
        assert_eq!(value["apiVersion"], "v1");
        assert_eq!(value["kind"], "ServiceAccount");
        assert_eq!(value["metadata"]["name"], "istio-pilot-service-account");
    }

    #[test]
    fn test_decode_supported_kind() {
        let object = DesiredObject::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "istio", "namespace": NS },
            "data": { "mesh": "{}" }
        }))
        .unwrap();
        assert_eq!(object.kind(), "ConfigMap");
        assert_eq!(object.name(), "istio");
        assert_eq!(object.namespace(), Some(NS));
    }

    /// Story: a manifest of an unknown kind is an explicit decode error
    #[test]
    fn story_unsupported_kind_is_rejected() {
        let err = DesiredObject::from_value(serde_json::json!({
            "apiVersion": "batch/v1",
            "kind": "CronJob",
            "metadata": { "name": "cleanup" }
        }))
        .unwrap_err();
        match err {
            Error::Decode { kind, message, .. } => {
                assert_eq!(kind.as_deref(), Some("CronJob"));
                assert!(message.contains("unsupported kind"));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_wrong_api_version_fails() {
        let err = DesiredObject::from_value(serde_json::json!({
            "apiVersion": "policy/v1beta1",
            "kind": "PodDisruptionBudget",
            "metadata": { "name": "pdb" }
        }))
        .unwrap_err();
        assert!(matches!(err, Error::Decode { .. }));
    }

    #[test]
    fn test_decode_missing_kind_fails() {
        let err = DesiredObject::from_value(serde_json::json!({ "metadata": {} })).unwrap_err();
        assert!(err.to_string().contains("no kind"));
    }

    #[test]
    fn test_mesh_config_from_istio() {
        let istio = Istio {
            metadata: KubeMeta {
                name: Some("mesh".to_string()),
                namespace: Some(NS.to_string()),
                uid: Some("uid-1".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: IstioSpec::default(),
            status: None,
        };
        let config = MeshConfig::from_istio(&istio).unwrap();
        assert_eq!(config.uid, "uid-1");
        assert_eq!(config.resource_version.as_deref(), Some("42"));
        assert_eq!(config.spec, defaults::resolve(&IstioSpec::default(), NS));
        assert_eq!(config.owner_kind(), "Istio");
        assert_eq!(config.owner_api_version(), "istio.banzaicloud.io/v1beta1");
    }

    #[test]
    fn test_mesh_config_requires_namespace() {
        let istio = Istio::new("mesh", IstioSpec::default());
        assert!(matches!(
            MeshConfig::from_istio(&istio),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_builder_order() {
        let config = default_config();
        let names: Vec<String> = builders(&config, &[])
            .iter()
            .map(|b| b.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "mesh-config",
                "citadel",
                "galley",
                "pilot",
                "mixer",
                "egress-gateway",
                "ingress-gateway",
                "sidecar-injector",
                "nodeagent",
                "istio-coredns",
            ]
        );
    }
}
