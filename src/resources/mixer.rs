//! Mixer: the policy and telemetry backends
//!
//! Both run from the same image and configuration, each as its own
//! autoscaled deployment.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ContainerPort;

use crate::crd::is_enabled;
use crate::Result;

use super::templates::{self, env_field, labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "mixer";
const SERVICE_ACCOUNT: &str = "istio-mixer-service-account";
const CLUSTER_ROLE: &str = "istio-mixer-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-mixer-cluster-role-binding";

/// The two mixer roles
const ROLES: [&str; 2] = ["policy", "telemetry"];

/// Builds policy and telemetry
pub struct MixerBuilder;

fn role_labels(role: &str) -> BTreeMap<String, String> {
    labels(&[("app", role), ("istio", "mixer"), ("istio-mixer-type", role)])
}

fn deployment_name(role: &str) -> String {
    format!("istio-{role}")
}

fn mixer_args(role: &str, config: &MeshConfig) -> Vec<String> {
    let mut args = vec![
        "--monitoringPort=15014".to_string(),
        "--address".to_string(),
        "unix:///sock/mixer.socket".to_string(),
        "--log_output_level=default:info".to_string(),
        format!("--configStoreURL=mcp://istio-galley.{}.svc:9901", config.namespace),
        format!("--configDefaultNamespace={}", config.namespace),
        "--useAdapterCRDs=false".to_string(),
    ];
    if role == "telemetry" {
        args.push("--averageLatencyThreshold=100ms".to_string());
        args.push("--loadsheddingMode=enforce".to_string());
    }
    if is_enabled(config.spec.tracing.enabled) {
        args.push(format!(
            "--trace_zipkin_url=http://{}/api/v1/spans",
            config.spec.tracing.zipkin.address.clone().unwrap_or_default()
        ));
    }
    args
}

fn deployment(role: &str, config: &MeshConfig) -> Deployment {
    let mixer = &config.spec.mixer;
    let mut container = templates::container("mixer", &mixer.image, config);
    container.args = Some(mixer_args(role, config));
    container.ports = Some(
        [15014, 42422]
            .map(|port| ContainerPort {
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .to_vec(),
    );
    container.env = Some(vec![env_field("POD_NAMESPACE", "metadata.namespace")]);
    container.resources =
        templates::resources_or_default(&mixer.base.resources, &config.spec.default_resources);

    templates::deployment(
        &deployment_name(role),
        role_labels(role),
        mixer.base.replica_count,
        templates::pod_spec(SERVICE_ACCOUNT, vec![container], &mixer.base),
        config,
    )
}

impl ComponentBuilder for MixerBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.mixer.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let common = labels(&[("istio", "mixer")]);
        let mut set = DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, common.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                common.clone(),
                vec![
                    templates::rule(&["config.istio.io"], &["*"], &["create", "get", "list", "watch", "patch"]),
                    templates::rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"], &["get", "list", "watch"]),
                    templates::rule(&[""], &["configmaps", "endpoints", "pods", "services", "namespaces", "secrets", "replicationcontrollers"], &["get", "list", "watch"]),
                    templates::rule(&["extensions", "apps"], &["replicasets"], &["get", "list", "watch"]),
                ],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                common,
                config,
            ));

        for role in ROLES {
            let name = deployment_name(role);
            let role_labels = role_labels(role);
            let mut ports = vec![
                templates::port("grpc-mixer", 9091, "TCP"),
                templates::port("grpc-mixer-mtls", 15004, "TCP"),
                templates::port("http-monitoring", 15014, "TCP"),
            ];
            if role == "telemetry" {
                ports.push(templates::port("prometheus", 42422, "TCP"));
            }
            set.push(templates::service(
                &name,
                role_labels.clone(),
                role_labels.clone(),
                ports,
                config,
            ));
            set.push(deployment(role, config));
            set.push(templates::hpa(
                &name,
                role_labels,
                &config.spec.mixer.base,
                config,
            ));
        }
        Ok(set)
    }
}
