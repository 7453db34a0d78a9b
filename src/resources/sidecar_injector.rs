//! Automatic sidecar injection
//!
//! The injector runs as a mutating admission webhook. Its injection template
//! is rendered here from the resolved proxy settings and shipped in a
//! ConfigMap the webhook reads on start.

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhook, MutatingWebhookConfiguration, RuleWithOperations, ServiceReference,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, ContainerPort, ExecAction, KeyToPath, Probe,
    SecretVolumeSource, ServicePort, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;

use crate::crd::is_enabled;
use crate::{Error, Result};

use super::templates::{self, labels, merge_labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "sidecar-injector";
const SERVICE_ACCOUNT: &str = "istio-sidecar-injector-service-account";
const CLUSTER_ROLE: &str = "istio-sidecar-injector-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-sidecar-injector-admin-role-binding";
const NAME: &str = "istio-sidecar-injector";
const WEBHOOK: &str = "sidecar-injector.istio.io";
const INJECTION_LABEL: &str = "istio-injection";
/// Port the webhook server listens on inside the pod
const WEBHOOK_PORT: i32 = 9443;

/// Builds the injection webhook
pub struct SidecarInjectorBuilder;

fn component_labels() -> BTreeMap<String, String> {
    labels(&[("app", "sidecarInjectorWebhook")])
}

fn selector() -> BTreeMap<String, String> {
    labels(&[("istio", "sidecar-injector")])
}

/// Namespaces the webhook intercepts
///
/// With the auto injection policy only namespaces labeled for injection are
/// selected; otherwise every namespace not explicitly opted out is.
pub fn namespace_selector(config: &MeshConfig) -> LabelSelector {
    if is_enabled(config.spec.sidecar_injector.auto_injection_policy_enabled) {
        LabelSelector {
            match_labels: Some(labels(&[(INJECTION_LABEL, "enabled")])),
            ..Default::default()
        }
    } else {
        LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: INJECTION_LABEL.to_string(),
                operator: "NotIn".to_string(),
                values: Some(vec!["disabled".to_string()]),
            }]),
            ..Default::default()
        }
    }
}

/// Pod template the webhook merges into injected pods
fn injection_template(config: &MeshConfig) -> Result<String> {
    let spec = &config.spec;
    let include = spec.include_ip_ranges.clone().unwrap_or_default();
    let exclude = spec.exclude_ip_ranges.clone().unwrap_or_default();

    let mut init_containers = Vec::new();
    if !is_enabled(spec.sidecar_injector.init_cni_configuration.enabled) {
        init_containers.push(json!({
            "name": "istio-init",
            "image": spec.proxy_init.image,
            "imagePullPolicy": spec.image_pull_policy,
            "args": ["-p", "15001", "-u", "1337", "-m", "REDIRECT", "-i", include, "-x", exclude],
            "resources": spec.sidecar_injector.init.resources,
            "securityContext": { "capabilities": { "add": ["NET_ADMIN"] }, "runAsNonRoot": false, "runAsUser": 0 },
        }));
    }

    let template = json!({
        "initContainers": init_containers,
        "containers": [{
            "name": "istio-proxy",
            "image": spec.proxy.image,
            "imagePullPolicy": spec.image_pull_policy,
            "args": [
                "proxy", "sidecar",
                "--domain", "$(POD_NAMESPACE).svc.cluster.local",
                "--proxyLogLevel", spec.proxy.log_level,
                "--proxyComponentLogLevel", spec.proxy.component_log_level,
                "--dnsRefreshRate", spec.proxy.dns_refresh_rate,
                "--discoveryAddress", format!("istio-pilot.{}:15010", config.namespace),
                "--zipkinAddress", spec.tracing.zipkin.address,
            ],
            "resources": spec.proxy.resources,
            "securityContext": { "readOnlyRootFilesystem": true, "runAsUser": 1337 },
        }],
    });
    serde_yaml::to_string(&template)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))
}

impl SidecarInjectorBuilder {
    fn config_map(&self, config: &MeshConfig) -> Result<ConfigMap> {
        let policy = if is_enabled(config.spec.sidecar_injector.auto_injection_policy_enabled) {
            "enabled"
        } else {
            "disabled"
        };
        let body = json!({ "policy": policy, "template": injection_template(config)? });
        let rendered = serde_yaml::to_string(&body)
            .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
        Ok(ConfigMap {
            metadata: templates::object_meta(NAME, component_labels(), config),
            data: Some(BTreeMap::from([("config".to_string(), rendered)])),
            ..Default::default()
        })
    }

    fn deployment(&self, config: &MeshConfig) -> Deployment {
        let injector = &config.spec.sidecar_injector;
        let mut container =
            templates::container("sidecar-injector-webhook", &injector.image, config);
        container.args = Some(
            [
                "--caCertFile=/etc/istio/certs/root-cert.pem",
                "--tlsCertFile=/etc/istio/certs/cert-chain.pem",
                "--tlsKeyFile=/etc/istio/certs/key.pem",
                "--injectConfig=/etc/istio/inject/config",
                "--meshConfig=/etc/istio/config/mesh",
                "--healthCheckInterval=2s",
                "--healthCheckFile=/health",
            ]
            .map(String::from)
            .into_iter()
            .chain([format!("--port={WEBHOOK_PORT}")])
            .collect(),
        );
        container.ports = Some(vec![ContainerPort {
            name: Some("https-inject".to_string()),
            container_port: WEBHOOK_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        let probe = Probe {
            exec: Some(ExecAction {
                command: Some(
                    [
                        "/usr/local/bin/sidecar-injector",
                        "probe",
                        "--probe-path=/health",
                        "--interval=4s",
                    ]
                    .map(String::from)
                    .to_vec(),
                ),
            }),
            initial_delay_seconds: Some(4),
            period_seconds: Some(4),
            ..Default::default()
        };
        container.liveness_probe = Some(probe.clone());
        container.readiness_probe = Some(probe);
        container.resources =
            templates::resources_or_default(&injector.base.resources, &config.spec.default_resources);
        container.volume_mounts = Some(
            [
                ("config-volume", "/etc/istio/config"),
                ("certs", "/etc/istio/certs"),
                ("inject-config", "/etc/istio/inject"),
            ]
            .map(|(name, path)| VolumeMount {
                name: name.to_string(),
                mount_path: path.to_string(),
                read_only: Some(true),
                ..Default::default()
            })
            .to_vec(),
        );

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, vec![container], &injector.base);
        pod.volumes = Some(vec![
            Volume {
                name: "config-volume".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: "istio".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "certs".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(format!("istio.{SERVICE_ACCOUNT}")),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "inject-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: NAME.to_string(),
                    items: Some(vec![KeyToPath {
                        key: "config".to_string(),
                        path: "config".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ]);

        templates::deployment(
            NAME,
            merge_labels(&[&component_labels(), &selector()]),
            injector.base.replica_count,
            pod,
            config,
        )
    }

    fn webhook(&self, config: &MeshConfig) -> MutatingWebhookConfiguration {
        MutatingWebhookConfiguration {
            metadata: templates::cluster_object_meta(NAME, component_labels()),
            webhooks: Some(vec![MutatingWebhook {
                name: WEBHOOK.to_string(),
                admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
                side_effects: "None".to_string(),
                failure_policy: Some("Fail".to_string()),
                client_config: WebhookClientConfig {
                    service: Some(ServiceReference {
                        name: NAME.to_string(),
                        namespace: config.namespace.clone(),
                        path: Some("/inject".to_string()),
                        port: Some(443),
                    }),
                    ..Default::default()
                },
                rules: Some(vec![RuleWithOperations {
                    api_groups: Some(vec![String::new()]),
                    api_versions: Some(vec!["v1".to_string()]),
                    operations: Some(vec!["CREATE".to_string()]),
                    resources: Some(vec!["pods".to_string()]),
                    ..Default::default()
                }]),
                namespace_selector: Some(namespace_selector(config)),
                ..Default::default()
            }]),
        }
    }
}

impl ComponentBuilder for SidecarInjectorBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.sidecar_injector.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let labels = component_labels();
        let service = templates::service(
            NAME,
            merge_labels(&[&labels, &selector()]),
            selector(),
            vec![ServicePort {
                target_port: Some(IntOrString::Int(WEBHOOK_PORT)),
                ..templates::port("https-inject", 443, "TCP")
            }],
            config,
        );

        Ok(DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, labels.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                labels.clone(),
                vec![
                    templates::rule(&[""], &["configmaps"], &["get", "list", "watch"]),
                    templates::rule(
                        &["admissionregistration.k8s.io"],
                        &["mutatingwebhookconfigurations"],
                        &["get", "list", "watch", "patch"],
                    ),
                ],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                labels,
                config,
            ))
            .with(self.config_map(config)?)
            .with(service)
            .with(self.deployment(config))
            .with(self.webhook(config)))
    }
}
