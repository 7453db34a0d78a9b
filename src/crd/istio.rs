//! Istio Custom Resource Definition
//!
//! An `Istio` resource describes one mesh control plane. Every field is
//! optional on input; the defaulting pass in [`crate::defaults`] fills in
//! whatever the user left unset.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, ServicePort};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{carry_transitions, BaseK8sConfiguration, Condition, MeshPhase};

/// Specification for an Istio mesh
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "istio.banzaicloud.io",
    version = "v1beta1",
    kind = "Istio",
    plural = "istios",
    status = "IstioStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct IstioSpec {
    /// Outbound IP ranges intercepted by the sidecar ("*" for all)
    #[serde(default, rename = "includeIPRanges", skip_serializing_if = "Option::is_none")]
    pub include_ip_ranges: Option<String>,

    /// Outbound IP ranges excluded from interception
    #[serde(default, rename = "excludeIPRanges", skip_serializing_if = "Option::is_none")]
    pub exclude_ip_ranges: Option<String>,

    /// Mesh-wide resource baseline for components without their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resources: Option<ResourceRequirements>,

    /// Default pod disruption budget for control plane components
    #[serde(default)]
    pub default_pod_disruption_budget: PdbConfiguration,

    /// Pilot (discovery) configuration
    #[serde(default)]
    pub pilot: PilotConfiguration,

    /// Citadel (certificate issuance) configuration
    #[serde(default)]
    pub citadel: CitadelConfiguration,

    /// Galley (configuration validation) configuration
    #[serde(default)]
    pub galley: GalleyConfiguration,

    /// Mixer (policy and telemetry) configuration
    #[serde(default)]
    pub mixer: MixerConfiguration,

    /// Gateway configuration keyed by gateway name
    #[serde(default)]
    pub gateways: GatewaysConfiguration,

    /// Sidecar injector configuration
    #[serde(default)]
    pub sidecar_injector: SidecarInjectorConfiguration,

    /// Node agent configuration
    #[serde(default)]
    pub node_agent: NodeAgentConfiguration,

    /// Secret discovery service configuration
    #[serde(default)]
    pub sds: SdsConfiguration,

    /// Sidecar proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfiguration,

    /// Proxy init container configuration
    #[serde(default)]
    pub proxy_init: ProxyInitConfiguration,

    /// Outbound traffic policy
    #[serde(default)]
    pub outbound_traffic_policy: OutboundTrafficPolicyConfiguration,

    /// Distributed tracing backend
    #[serde(default)]
    pub tracing: TracingConfiguration,

    /// CoreDNS with the Istio plugin, used for multi mesh
    #[serde(default, rename = "istioCoreDNS")]
    pub istio_coredns: CoreDnsConfiguration,

    /// Expose control plane ports on the ingress gateway for workloads outside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_expansion: Option<bool>,

    /// Enable multi mesh support
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_mesh: Option<bool>,

    /// Distribute configuration over MCP from Galley
    #[serde(default, rename = "useMCP", skip_serializing_if = "Option::is_none")]
    pub use_mcp: Option<bool>,

    /// Image pull policy for every container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

/// Status of an Istio mesh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioStatus {
    /// Current phase
    #[serde(default)]
    pub phase: MeshPhase,

    /// Human-readable detail for the phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl IstioStatus {
    /// Status in the given phase with a message
    pub fn with_phase(phase: MeshPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Attach the observed generation
    pub fn observed(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    /// Append a condition
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Keep transition times of conditions unchanged since `previous`
    pub fn since(mut self, previous: Option<&IstioStatus>) -> Self {
        if let Some(previous) = previous {
            self.conditions = carry_transitions(self.conditions, &previous.conditions);
        }
        self
    }
}

/// Pod disruption budget toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdbConfiguration {
    /// Create a PodDisruptionBudget for scalable components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Pilot configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PilotConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Run a proxy sidecar next to discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<bool>,

    /// Trace sampling percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_sampling: Option<f64>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// Citadel configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CitadelConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Secret holding a user supplied CA; absent means self-signed
    #[serde(default, rename = "caSecretName", skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,

    /// Enable the liveness probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<bool>,

    /// TTL of issued workload certificates
    #[serde(default, rename = "workloadCertTTL", skip_serializing_if = "Option::is_none")]
    pub workload_cert_ttl: Option<String>,

    /// Maximum TTL a workload may request
    #[serde(default, rename = "maxWorkloadCertTTL", skip_serializing_if = "Option::is_none")]
    pub max_workload_cert_ttl: Option<String>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// Galley configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GalleyConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// Mixer configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MixerConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// All gateways of the mesh
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaysConfiguration {
    /// Tri-state enable flag for every gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Gateway configuration keyed by name ("ingress", "egress", ...)
    #[serde(default)]
    pub configs: BTreeMap<String, GatewayConfiguration>,
}

/// One gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Service type (LoadBalancer, ClusterIP, NodePort)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,

    /// Requested load balancer IP
    #[serde(default, rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,

    /// Service ports; empty means "use the defaults for this gateway"
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,

    /// Extra labels on the gateway service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_labels: Option<BTreeMap<String, String>>,

    /// Annotations on the gateway service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_annotations: Option<BTreeMap<String, String>>,

    /// SDS sidecar for gateway certificates
    #[serde(default)]
    pub sds: GatewaySdsConfiguration,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// SDS sidecar of a gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySdsConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Sidecar injector configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SidecarInjectorConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Inject only into namespaces labeled `istio-injection=enabled`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_injection_policy_enabled: Option<bool>,

    /// Use the CNI plugin instead of the privileged init container
    #[serde(default, rename = "initCNIConfiguration")]
    pub init_cni_configuration: InitCniConfiguration,

    /// Proxy init container of injected pods
    #[serde(default)]
    pub init: InitConfiguration,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// Istio CNI plugin configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitCniConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Installer image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Host directory holding CNI binaries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin_dir: Option<String>,

    /// Host directory holding CNI configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conf_dir: Option<String>,

    /// Namespaces the plugin ignores
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_namespaces: Option<Vec<String>>,

    /// Plugin log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Init container sizing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitConfiguration {
    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Node agent configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

/// Secret discovery service configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdsConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Unix domain socket the node agent serves on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uds_path: Option<String>,

    /// Audience of the projected service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_audience: Option<String>,
}

/// Sidecar proxy configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfiguration {
    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Proxy container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Per-component Envoy log levels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_log_level: Option<String>,

    /// Envoy log level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// DNS refresh rate for STRICT_DNS clusters
    #[serde(default, rename = "dnsRefreshRate", skip_serializing_if = "Option::is_none")]
    pub dns_refresh_rate: Option<String>,
}

/// Proxy init container configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyInitConfiguration {
    /// Container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Outbound traffic policy
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTrafficPolicyConfiguration {
    /// ALLOW_ANY or REGISTRY_ONLY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// Tracing backend
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TracerType {
    /// Zipkin
    #[default]
    Zipkin,
    /// Lightstep
    Lightstep,
    /// Datadog
    Datadog,
}

impl std::fmt::Display for TracerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Zipkin => write!(f, "zipkin"),
            Self::Lightstep => write!(f, "lightstep"),
            Self::Datadog => write!(f, "datadog"),
        }
    }
}

/// Distributed tracing configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracingConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Selected backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracer: Option<TracerType>,

    /// Zipkin collector
    #[serde(default)]
    pub zipkin: TracerAddress,

    /// Datadog agent
    #[serde(default)]
    pub datadog: TracerAddress,

    /// Lightstep satellite
    #[serde(default)]
    pub lightstep: LightstepConfiguration,
}

/// Address of a tracing collector
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TracerAddress {
    /// host:port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Lightstep satellite configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LightstepConfiguration {
    /// host:port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Access token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Use TLS to the satellite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
}

/// CoreDNS with the Istio plugin
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CoreDnsConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// CoreDNS image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Istio plugin image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_image: Option<String>,

    /// Scheduling and sizing
    #[serde(flatten)]
    pub base: BaseK8sConfiguration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_empty_spec_deserializes() {
        let spec: IstioSpec = serde_json::from_str("{}").unwrap();
        assert_eq!(spec, IstioSpec::default());
    }

    #[test]
    fn test_field_names_match_api() {
        let spec: IstioSpec = serde_json::from_value(serde_json::json!({
            "includeIPRanges": "10.0.0.0/8",
            "meshExpansion": true,
            "useMCP": false,
            "citadel": {
                "caSecretName": "cacerts",
                "workloadCertTTL": "24h",
                "replicaCount": 1
            },
            "gateways": {
                "enabled": true,
                "configs": {
                    "ingress": { "serviceType": "NodePort", "loadBalancerIP": "1.2.3.4" }
                }
            },
            "istioCoreDNS": { "enabled": true }
        }))
        .unwrap();

        assert_eq!(spec.include_ip_ranges.as_deref(), Some("10.0.0.0/8"));
        assert_eq!(spec.mesh_expansion, Some(true));
        assert_eq!(spec.use_mcp, Some(false));
        assert_eq!(spec.citadel.ca_secret_name.as_deref(), Some("cacerts"));
        assert_eq!(spec.citadel.workload_cert_ttl.as_deref(), Some("24h"));
        assert_eq!(spec.citadel.base.replica_count, Some(1));
        let ingress = &spec.gateways.configs["ingress"];
        assert_eq!(ingress.service_type.as_deref(), Some("NodePort"));
        assert_eq!(ingress.load_balancer_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(spec.istio_coredns.enabled, Some(true));
    }

    #[test]
    fn test_tri_state_survives_round_trip() {
        let mut spec = IstioSpec::default();
        spec.pilot.enabled = Some(false);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["pilot"]["enabled"], false);
        assert!(json["citadel"].get("enabled").is_none());
    }

    #[test]
    fn test_crd_generation() {
        let crd = Istio::crd();
        assert_eq!(crd.metadata.name.as_deref(), Some("istios.istio.banzaicloud.io"));
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
