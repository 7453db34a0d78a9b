//! RemoteIstio Custom Resource Definition
//!
//! A `RemoteIstio` registers a peer cluster with the mesh running in the
//! same namespace. The resource name is the peer's cluster name.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{carry_transitions, Condition, SyncState};

/// Secret key holding the peer kubeconfig
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Specification for a peer cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "istio.banzaicloud.io",
    version = "v1beta1",
    kind = "RemoteIstio",
    plural = "remoteistios",
    status = "RemoteIstioStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Synced","type":"string","jsonPath":".status.lastSyncedVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIstioSpec {
    /// Outbound IP ranges intercepted by sidecars on the peer
    #[serde(default, rename = "includeIPRanges", skip_serializing_if = "Option::is_none")]
    pub include_ip_ranges: Option<String>,

    /// Outbound IP ranges excluded on the peer
    #[serde(default, rename = "excludeIPRanges", skip_serializing_if = "Option::is_none")]
    pub exclude_ip_ranges: Option<String>,

    /// Control plane services reachable from the peer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enabled_services: Vec<IstioService>,

    /// Sidecar injector running on the peer
    #[serde(default)]
    pub sidecar_injector: RemoteSidecarInjectorConfiguration,

    /// Citadel running on the peer
    #[serde(default)]
    pub citadel: RemoteCitadelConfiguration,

    /// Secret with the peer kubeconfig; defaults to the resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// A control plane service exposed to the peer as a selector-less service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioService {
    /// Service name, e.g. "istio-pilot"
    pub name: String,

    /// Extra labels on the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Addresses that back the service
    #[serde(default, rename = "podIPs", skip_serializing_if = "Vec::is_empty")]
    pub pod_ips: Vec<String>,

    /// Ports exposed by the service
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<IstioServicePort>,
}

/// Port of an exposed control plane service
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IstioServicePort {
    /// Port name
    pub name: String,
    /// Port number
    pub port: i32,
}

/// Sidecar injector sizing on the peer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSidecarInjectorConfiguration {
    /// Replica count
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,

    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// Citadel on the peer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCitadelConfiguration {
    /// Tri-state enable flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Secret holding a user supplied CA
    #[serde(default, rename = "caSecretName", skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

/// Status of a peer cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIstioStatus {
    /// Sync state
    #[serde(default)]
    pub state: SyncState,

    /// Mesh resource version last converged on the peer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_version: Option<String>,

    /// Error or informational detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl RemoteIstioStatus {
    /// Keep transition times of conditions unchanged since `previous`
    pub fn since(mut self, previous: Option<&RemoteIstioStatus>) -> Self {
        if let Some(previous) = previous {
            self.conditions = carry_transitions(self.conditions, &previous.conditions);
        }
        self
    }
}

impl RemoteIstio {
    /// Name of the secret holding this peer's kubeconfig
    pub fn kubeconfig_secret(&self) -> String {
        self.spec
            .secret_name
            .clone()
            .or_else(|| self.metadata.name.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_kubeconfig_secret_defaults_to_name() {
        let mut remote = RemoteIstio::new("east", RemoteIstioSpec::default());
        assert_eq!(remote.kubeconfig_secret(), "east");

        remote.spec.secret_name = Some("east-credentials".to_string());
        assert_eq!(remote.kubeconfig_secret(), "east-credentials");
    }

    #[test]
    fn test_enabled_services_parse() {
        let spec: RemoteIstioSpec = serde_json::from_value(serde_json::json!({
            "includeIPRanges": "10.0.0.0/8",
            "enabledServices": [
                { "name": "istio-pilot", "podIPs": ["10.1.0.5"], "ports": [{ "name": "grpc-xds", "port": 15010 }] }
            ]
        }))
        .unwrap();
        assert_eq!(spec.enabled_services[0].pod_ips, vec!["10.1.0.5"]);
        assert_eq!(spec.enabled_services[0].ports[0].port, 15010);
    }

    #[test]
    fn test_crd_generation() {
        let crd = RemoteIstio::crd();
        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("remoteistios.istio.banzaicloud.io")
        );
    }
}
