//! CoreDNS with the Istio plugin, resolving `.global` names for multi mesh

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, ContainerPort, KeyToPath, Volume, VolumeMount,
};

use crate::crd::is_enabled;
use crate::Result;

use super::templates::{self, labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "istio-coredns";
const NAME: &str = "istiocoredns";
const SERVICE_ACCOUNT: &str = "istiocoredns-service-account";
const CLUSTER_ROLE: &str = "istiocoredns";
const CLUSTER_ROLE_BINDING: &str = "istiocoredns";

const COREFILE: &str = r#".:53 {
    errors
    health
    proxy global 127.0.0.1:8053 {
        protocol grpc insecure
    }
    prometheus :9153
    proxy . /etc/resolv.conf
    cache 30
    reload
}
"#;

/// Builds the multi mesh DNS server
pub struct CoreDnsBuilder;

fn component_labels() -> BTreeMap<String, String> {
    labels(&[("app", NAME)])
}

impl CoreDnsBuilder {
    fn deployment(&self, config: &MeshConfig) -> Deployment {
        let dns = &config.spec.istio_coredns;
        let resources =
            templates::resources_or_default(&dns.base.resources, &config.spec.default_resources);

        let mut coredns = templates::container("coredns", &dns.image, config);
        coredns.args = Some(vec!["-conf".to_string(), "/etc/coredns/Corefile".to_string()]);
        coredns.ports = Some(vec![
            ContainerPort {
                name: Some("dns".to_string()),
                container_port: 53,
                protocol: Some("UDP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("dns-tcp".to_string()),
                container_port: 53,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("metrics".to_string()),
                container_port: 9153,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]);
        coredns.volume_mounts = Some(vec![VolumeMount {
            name: "config-volume".to_string(),
            mount_path: "/etc/coredns".to_string(),
            ..Default::default()
        }]);
        coredns.resources = resources.clone();

        let mut plugin = templates::container("istio-coredns-plugin", &dns.plugin_image, config);
        plugin.command = Some(vec!["/usr/local/bin/plugin".to_string()]);
        plugin.ports = Some(vec![ContainerPort {
            name: Some("dns-grpc".to_string()),
            container_port: 8053,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]);
        plugin.resources = resources;

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, vec![coredns, plugin], &dns.base);
        pod.dns_policy = Some("Default".to_string());
        pod.volumes = Some(vec![Volume {
            name: "config-volume".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: NAME.to_string(),
                items: Some(vec![KeyToPath {
                    key: "Corefile".to_string(),
                    path: "Corefile".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        templates::deployment(NAME, component_labels(), dns.base.replica_count, pod, config)
    }
}

impl ComponentBuilder for CoreDnsBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.istio_coredns.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let labels = component_labels();
        Ok(DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, labels.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                labels.clone(),
                vec![templates::rule(
                    &["networking.istio.io"],
                    &["*"],
                    &["get", "watch", "list"],
                )],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                labels.clone(),
                config,
            ))
            .with(ConfigMap {
                metadata: templates::object_meta(NAME, labels.clone(), config),
                data: Some(BTreeMap::from([("Corefile".to_string(), COREFILE.to_string())])),
                ..Default::default()
            })
            .with(templates::service(
                NAME,
                labels.clone(),
                labels,
                vec![
                    templates::port("dns", 53, "UDP"),
                    templates::port("dns-tcp", 53, "TCP"),
                ],
                config,
            ))
            .with(self.deployment(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::DesiredObject;
    use super::*;
    use crate::crd::IstioSpec;

    fn enabled_config() -> MeshConfig {
        let mut spec = IstioSpec::default();
        spec.istio_coredns.enabled = Some(true);
        config(spec)
    }

    #[test]
    fn test_enablement() {
        assert!(!CoreDnsBuilder.enabled(&default_config()));
        assert!(CoreDnsBuilder.enabled(&enabled_config()));
    }

    #[test]
    fn test_dns_service_serves_udp_and_tcp() {
        let set = CoreDnsBuilder.build(&enabled_config()).unwrap();
        let Some(DesiredObject::Service(svc)) = set.find("Service", NAME) else {
            panic!("no dns service");
        };
        let protocols: Vec<String> = svc
            .spec
            .clone()
            .unwrap()
            .ports
            .unwrap()
            .into_iter()
            .filter_map(|p| p.protocol)
            .collect();
        assert_eq!(protocols, vec!["UDP", "TCP"]);
    }

    #[test]
    fn test_corefile_forwards_global_to_plugin() {
        let set = CoreDnsBuilder.build(&enabled_config()).unwrap();
        let Some(DesiredObject::ConfigMap(cm)) = set.find("ConfigMap", NAME) else {
            panic!("no corefile");
        };
        assert!(cm.data.clone().unwrap()["Corefile"].contains("proxy global 127.0.0.1:8053"));
    }
}
