//! Object templates shared by the component builders

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, ObjectFieldSelector,
    PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, SecretVolumeSource,
    Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::BaseK8sConfiguration;

use super::MeshConfig;

/// Label marking objects managed by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY: &str = "mesh-operator";

/// Build a label map from static pairs
pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Merge label maps; later maps win on conflicting keys
pub fn merge_labels(maps: &[&BTreeMap<String, String>]) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for map in maps {
        out.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

/// Metadata of a namespaced object in the mesh namespace
pub fn object_meta(
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
    config: &MeshConfig,
) -> ObjectMeta {
    let mut labels = labels;
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    ObjectMeta {
        name: Some(name.into()),
        namespace: Some(config.namespace.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Metadata of a namespaced object carrying annotations
pub fn object_meta_with_annotations(
    name: impl Into<String>,
    labels: BTreeMap<String, String>,
    annotations: Option<BTreeMap<String, String>>,
    config: &MeshConfig,
) -> ObjectMeta {
    ObjectMeta {
        annotations: annotations.filter(|a| !a.is_empty()),
        ..object_meta(name, labels, config)
    }
}

/// Metadata of a cluster-scoped object
pub fn cluster_object_meta(name: impl Into<String>, labels: BTreeMap<String, String>) -> ObjectMeta {
    let mut labels = labels;
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string());
    ObjectMeta {
        name: Some(name.into()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// Annotations put on every control plane pod template
pub fn default_deploy_annotations() -> BTreeMap<String, String> {
    labels(&[
        ("sidecar.istio.io/inject", "false"),
        ("scheduler.alpha.kubernetes.io/critical-pod", ""),
    ])
}

/// Rolling update with full surge and 25% unavailability
pub fn default_rolling_update_strategy() -> DeploymentStrategy {
    DeploymentStrategy {
        type_: Some("RollingUpdate".to_string()),
        rolling_update: Some(RollingUpdateDeployment {
            max_surge: Some(IntOrString::String("100%".to_string())),
            max_unavailable: Some(IntOrString::String("25%".to_string())),
        }),
    }
}

/// Component resources, falling back to the mesh-wide baseline
pub fn resources_or_default(
    own: &Option<ResourceRequirements>,
    fallback: &Option<ResourceRequirements>,
) -> Option<ResourceRequirements> {
    own.clone().or_else(|| fallback.clone())
}

/// Plain environment variable
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Environment variable from the downward API
pub fn env_field(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: Some("v1".to_string()),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Container with the mesh image pull policy and default termination handling
pub fn container(name: &str, image: &Option<String>, config: &MeshConfig) -> Container {
    Container {
        name: name.to_string(),
        image: image.clone(),
        image_pull_policy: config.spec.image_pull_policy.clone(),
        termination_message_path: Some("/dev/termination-log".to_string()),
        termination_message_policy: Some("File".to_string()),
        ..Default::default()
    }
}

/// Pod spec with scheduling fields passed through from the component config
pub fn pod_spec(
    service_account: &str,
    containers: Vec<Container>,
    placement: &BaseK8sConfiguration,
) -> PodSpec {
    PodSpec {
        service_account_name: Some(service_account.to_string()),
        dns_policy: Some("ClusterFirst".to_string()),
        restart_policy: Some("Always".to_string()),
        termination_grace_period_seconds: Some(30),
        security_context: Some(PodSecurityContext::default()),
        scheduler_name: Some("default-scheduler".to_string()),
        containers,
        affinity: placement.affinity.clone(),
        node_selector: placement.node_selector.clone(),
        tolerations: placement.tolerations.clone(),
        ..Default::default()
    }
}

/// Volume backed by a ConfigMap in the pod's namespace
pub fn config_map_volume(name: &str, config_map: &str) -> Volume {
    Volume {
        name: name.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Volume backed by a Secret in the pod's namespace
pub fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Read-only mount of a pod volume
pub fn read_only_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Deployment whose labels, selector and pod labels are `labels`
pub fn deployment(
    name: &str,
    labels: BTreeMap<String, String>,
    replicas: Option<i32>,
    pod_spec: PodSpec,
    config: &MeshConfig,
) -> Deployment {
    Deployment {
        metadata: object_meta(name, labels.clone(), config),
        spec: Some(DeploymentSpec {
            replicas,
            strategy: Some(default_rolling_update_strategy()),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(default_deploy_annotations()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// ClusterIP service selecting `selector`
pub fn service(
    name: &str,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    ports: Vec<ServicePort>,
    config: &MeshConfig,
) -> Service {
    Service {
        metadata: object_meta(name, labels, config),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(selector),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Named service port without a node port
pub fn port(name: &str, port: i32, protocol: &str) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some(protocol.to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// Service account in the mesh namespace
pub fn service_account(
    name: &str,
    labels: BTreeMap<String, String>,
    config: &MeshConfig,
) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(name, labels, config),
        ..Default::default()
    }
}

/// RBAC rule
pub fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(api_groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// Cluster role with the given rules
pub fn cluster_role(
    name: &str,
    labels: BTreeMap<String, String>,
    rules: Vec<PolicyRule>,
) -> ClusterRole {
    ClusterRole {
        metadata: cluster_object_meta(name, labels),
        rules: Some(rules),
        ..Default::default()
    }
}

/// Binding of a cluster role to a service account in the mesh namespace
pub fn cluster_role_binding(
    name: &str,
    role: &str,
    service_account: &str,
    labels: BTreeMap<String, String>,
    config: &MeshConfig,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: cluster_object_meta(name, labels),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        }]),
    }
}

/// CPU-based autoscaler for a deployment
pub fn hpa(
    name: &str,
    labels: BTreeMap<String, String>,
    base: &BaseK8sConfiguration,
    config: &MeshConfig,
) -> HorizontalPodAutoscaler {
    HorizontalPodAutoscaler {
        metadata: object_meta(name, labels, config),
        spec: Some(HorizontalPodAutoscalerSpec {
            min_replicas: base.min_replicas,
            max_replicas: base.max_replicas.unwrap_or(1),
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: name.to_string(),
            },
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(80),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Disruption budget keeping one pod available
pub fn pdb(
    name: &str,
    labels: BTreeMap<String, String>,
    selector: BTreeMap<String, String>,
    config: &MeshConfig,
) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: object_meta(name, labels, config),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
