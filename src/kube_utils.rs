//! Kubernetes helpers shared by the engine and the remote cluster manager

use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// Connect timeout for peer cluster clients
pub const REMOTE_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read timeout for peer cluster clients
pub const REMOTE_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Kinds whose plural is not derivable from the simple rules below
const KIND_PLURALS: &[(&str, &str)] = &[("endpoints", "endpoints")];

/// Parse an apiVersion string into (group, version)
///
/// ```
/// use mesh_operator::kube_utils::parse_api_version;
///
/// assert_eq!(parse_api_version("apps/v1"), ("apps".to_string(), "v1".to_string()));
/// assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an `ApiResource` from an apiVersion and kind
///
/// ```ignore
/// let ar = build_api_resource("apps/v1", "Deployment");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "istio-system", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Build a client from kubeconfig YAML with explicit timeouts
pub async fn client_from_kubeconfig(
    kubeconfig_yaml: &str,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig_yaml).map_err(|e| {
        Error::internal_with_context("create_client", format!("invalid kubeconfig: {}", e))
    })?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to load kubeconfig: {}", e))
        })?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, safe to persist in annotations.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(pluralize_kind("ClusterRoleBinding"), "clusterrolebindings");
        assert_eq!(pluralize_kind("Endpoints"), "endpoints");
        assert_eq!(pluralize_kind("PodDisruptionBudget"), "poddisruptionbudgets");
        assert_eq!(
            pluralize_kind("MutatingWebhookConfiguration"),
            "mutatingwebhookconfigurations"
        );
        assert_eq!(pluralize_kind("Policy"), "policies");
        assert_eq!(pluralize_kind("Gateway"), "gateways");
    }

    #[test]
    fn test_build_api_resource_core_group() {
        let ar = build_api_resource("v1", "ServiceAccount");
        assert_eq!(ar.group, "");
        assert_eq!(ar.version, "v1");
        assert_eq!(ar.plural, "serviceaccounts");
    }

    #[test]
    fn test_build_api_resource_named_group() {
        let ar = build_api_resource("autoscaling/v2", "HorizontalPodAutoscaler");
        assert_eq!(ar.group, "autoscaling");
        assert_eq!(ar.version, "v2");
        assert_eq!(ar.plural, "horizontalpodautoscalers");
    }

    #[test]
    fn test_deterministic_hash_is_stable() {
        let a = deterministic_hash("{\"kind\":\"Service\"}");
        assert_eq!(a.len(), 16);
        assert_eq!(a, deterministic_hash("{\"kind\":\"Service\"}"));
        assert_ne!(a, deterministic_hash("{\"kind\":\"Deployment\"}"));
    }

    #[tokio::test]
    async fn test_client_from_garbage_kubeconfig_fails() {
        let result =
            client_from_kubeconfig("- a\n- b", REMOTE_CONNECT_TIMEOUT, REMOTE_READ_TIMEOUT).await;
        match result {
            Err(err) => assert!(err.to_string().contains("kubeconfig")),
            Ok(_) => panic!("garbage kubeconfig produced a client"),
        }
    }
}
