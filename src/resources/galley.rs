//! Galley: configuration validation and distribution

use std::collections::BTreeMap;

use k8s_openapi::api::admissionregistration::v1::{
    RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
    WebhookClientConfig,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, ContainerPort};

use crate::crd::is_enabled;
use crate::{Error, Result};

use super::templates::{self, env_field, labels, merge_labels};
use super::{mesh, ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "galley";
const SERVICE_ACCOUNT: &str = "istio-galley-service-account";
const CLUSTER_ROLE: &str = "istio-galley-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-galley-cluster-role-binding";
const NAME: &str = "istio-galley";
const CONFIGURATION: &str = "istio-galley-configuration";
const WEBHOOK_CONFIG_KEY: &str = "validatingwebhookconfiguration.yaml";

/// Builds the validation and MCP server
pub struct GalleyBuilder;

fn galley_args(config: &MeshConfig) -> Vec<String> {
    let use_mcp = is_enabled(config.spec.use_mcp);
    vec![
        "server".to_string(),
        "--meshConfigFile=/etc/mesh-config/mesh".to_string(),
        "--livenessProbeInterval=1s".to_string(),
        "--livenessProbePath=/healthliveness".to_string(),
        "--readinessProbePath=/healthready".to_string(),
        "--readinessProbeInterval=1s".to_string(),
        format!("--deployment-namespace={}", config.namespace),
        "--insecure=true".to_string(),
        format!("--enable-server={use_mcp}"),
        "--validation-webhook-config-file".to_string(),
        "/etc/config/validatingwebhookconfiguration.yaml".to_string(),
        "--monitoringPort=15014".to_string(),
        "--log_output_level=default:info".to_string(),
    ]
}

fn validation_webhook(
    name: &str,
    path: &str,
    groups: &[&str],
    config: &MeshConfig,
) -> ValidatingWebhook {
    ValidatingWebhook {
        name: name.to_string(),
        admission_review_versions: vec!["v1".to_string(), "v1beta1".to_string()],
        side_effects: "None".to_string(),
        failure_policy: Some("Fail".to_string()),
        client_config: WebhookClientConfig {
            service: Some(ServiceReference {
                name: NAME.to_string(),
                namespace: config.namespace.clone(),
                path: Some(path.to_string()),
                port: Some(443),
            }),
            ..Default::default()
        },
        rules: Some(vec![RuleWithOperations {
            api_groups: Some(groups.iter().map(|g| g.to_string()).collect()),
            api_versions: Some(vec!["*".to_string()]),
            operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
            resources: Some(vec!["*".to_string()]),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

/// Webhook configuration galley registers itself once its server is up
fn webhook_configuration(config: &MeshConfig) -> ValidatingWebhookConfiguration {
    let mut webhooks = vec![validation_webhook(
        "pilot.validation.istio.io",
        "/admitpilot",
        &["config.istio.io", "rbac.istio.io", "authentication.istio.io", "networking.istio.io"],
        config,
    )];
    if is_enabled(config.spec.mixer.enabled) {
        webhooks.push(validation_webhook(
            "mixer.validation.istio.io",
            "/admitmixer",
            &["config.istio.io"],
            config,
        ));
    }
    ValidatingWebhookConfiguration {
        metadata: templates::cluster_object_meta(NAME, labels(&[("app", "galley")])),
        webhooks: Some(webhooks),
    }
}

impl GalleyBuilder {
    fn configuration(&self, config: &MeshConfig) -> Result<ConfigMap> {
        let rendered = serde_yaml::to_string(&webhook_configuration(config))
            .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;
        Ok(ConfigMap {
            metadata: templates::object_meta(CONFIGURATION, labels(&[("app", "galley")]), config),
            data: Some(BTreeMap::from([(WEBHOOK_CONFIG_KEY.to_string(), rendered)])),
            ..Default::default()
        })
    }

    fn deployment(&self, config: &MeshConfig) -> Deployment {
        let galley = &config.spec.galley;
        let mut container = templates::container("galley", &galley.image, config);
        container.args = Some(galley_args(config));
        container.ports = Some(
            [443, 15014, 9901]
                .map(|port| ContainerPort {
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .to_vec(),
        );
        container.env = Some(vec![env_field("POD_NAMESPACE", "metadata.namespace")]);
        container.resources =
            templates::resources_or_default(&galley.base.resources, &config.spec.default_resources);
        container.volume_mounts = Some(vec![
            templates::read_only_mount("certs", "/etc/certs"),
            templates::read_only_mount("config", "/etc/config"),
            templates::read_only_mount("mesh-config", "/etc/mesh-config"),
        ]);

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, vec![container], &galley.base);
        pod.volumes = Some(vec![
            templates::secret_volume("certs", &format!("istio.{SERVICE_ACCOUNT}")),
            templates::config_map_volume("config", CONFIGURATION),
            templates::config_map_volume("mesh-config", mesh::NAME),
        ]);

        templates::deployment(
            NAME,
            merge_labels(&[&labels(&[("app", "galley")]), &labels(&[("istio", "galley")])]),
            galley.base.replica_count,
            pod,
            config,
        )
    }
}

impl ComponentBuilder for GalleyBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.galley.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let app = labels(&[("app", "galley")]);
        let selector = labels(&[("istio", "galley")]);
        let selected = merge_labels(&[&app, &selector]);

        let mut set = DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, app.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                app.clone(),
                vec![
                    templates::rule(
                        &["admissionregistration.k8s.io"],
                        &["validatingwebhookconfigurations"],
                        &["*"],
                    ),
                    templates::rule(
                        &["config.istio.io", "rbac.istio.io", "networking.istio.io", "authentication.istio.io"],
                        &["*"],
                        &["get", "list", "watch"],
                    ),
                    templates::rule(&["*"], &["deployments"], &["get"]),
                    templates::rule(&[""], &["pods", "nodes", "services", "endpoints"], &["get", "list", "watch"]),
                    templates::rule(&["extensions"], &["ingresses"], &["get", "list", "watch"]),
                ],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                app,
                config,
            ))
            .with(templates::service(
                NAME,
                selected.clone(),
                selector,
                vec![
                    templates::port("https-validation", 443, "TCP"),
                    templates::port("http-monitoring", 15014, "TCP"),
                    templates::port("grpc-mcp", 9901, "TCP"),
                ],
                config,
            ))
            .with(self.configuration(config)?)
            .with(self.deployment(config));
        if is_enabled(config.spec.default_pod_disruption_budget.enabled) {
            set.push(templates::pdb(NAME, selected.clone(), selected, config));
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::DesiredObject;
    use super::*;
    use crate::crd::IstioSpec;

    #[test]
    fn test_mcp_flag_follows_spec() {
        assert!(galley_args(&default_config()).contains(&"--enable-server=true".to_string()));

        let mut spec = IstioSpec::default();
        spec.use_mcp = Some(false);
        assert!(galley_args(&config(spec)).contains(&"--enable-server=false".to_string()));
    }

    #[test]
    fn test_galley_objects() {
        let set = GalleyBuilder.build(&default_config()).unwrap();
        assert_eq!(set.component, COMPONENT);
        assert!(set.find("Service", NAME).is_some());
        assert!(set.find("Deployment", NAME).is_some());
        assert!(set.find("ClusterRoleBinding", CLUSTER_ROLE_BINDING).is_some());
        assert!(set.find("PodDisruptionBudget", NAME).is_none());
    }

    /// Story: every file galley is pointed at is mounted from an object the
    /// mesh builds
    #[test]
    fn story_galley_mounts_resolve_to_built_objects() {
        let set = GalleyBuilder.build(&default_config()).unwrap();
        let Some(DesiredObject::Deployment(deployment)) = set.find("Deployment", NAME) else {
            panic!("galley deployment missing");
        };
        let pod = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let container = &pod.containers[0];
        let args = container.args.as_ref().unwrap();
        let mounts = container.volume_mounts.as_ref().unwrap();
        let volumes = pod.volumes.as_ref().unwrap();

        let mount_path = |volume: &str| {
            mounts
                .iter()
                .find(|m| m.name == volume)
                .map(|m| m.mount_path.clone())
                .unwrap_or_else(|| panic!("no mount for {volume}"))
        };
        let config_map = |volume: &str| {
            volumes
                .iter()
                .find(|v| v.name == volume)
                .and_then(|v| v.config_map.as_ref())
                .map(|c| c.name.clone())
                .unwrap_or_else(|| panic!("no config map volume {volume}"))
        };

        assert!(args.contains(&format!("--meshConfigFile={}/mesh", mount_path("mesh-config"))));
        assert_eq!(config_map("mesh-config"), mesh::NAME);

        let webhook_file = format!("{}/{WEBHOOK_CONFIG_KEY}", mount_path("config"));
        assert!(args.contains(&webhook_file));
        assert_eq!(config_map("config"), CONFIGURATION);

        let Some(DesiredObject::ConfigMap(cm)) = set.find("ConfigMap", CONFIGURATION) else {
            panic!("galley configuration missing");
        };
        let webhook: ValidatingWebhookConfiguration =
            serde_yaml::from_str(&cm.data.as_ref().unwrap()[WEBHOOK_CONFIG_KEY]).unwrap();
        let names: Vec<&str> = webhook
            .webhooks
            .iter()
            .flatten()
            .map(|w| w.name.as_str())
            .collect();
        assert_eq!(names, vec!["pilot.validation.istio.io", "mixer.validation.istio.io"]);

        let certs = volumes.iter().find(|v| v.name == "certs").unwrap();
        assert_eq!(
            certs.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("istio.istio-galley-service-account")
        );
    }

    #[test]
    fn test_mixer_webhook_follows_mixer() {
        let mut spec = IstioSpec::default();
        spec.mixer.enabled = Some(false);
        let webhook = webhook_configuration(&config(spec));
        assert_eq!(webhook.webhooks.unwrap().len(), 1);
    }
}
