//! Ingress, egress and user defined gateways
//!
//! One builder runs per key of the gateway configuration map. Lookups of a
//! name that is not configured yield empty results instead of errors.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ContainerPort, EmptyDirVolumeSource, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};

use crate::crd::{is_enabled, GatewayConfiguration};
use crate::defaults::{mesh_expansion_ports, INGRESS};
use crate::Result;

use super::templates::{self, env, env_field, labels, merge_labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const SDS_VOLUME: &str = "sdsudspath";
const SDS_PATH: &str = "/var/run/ingress_gateway";

/// Builds one named gateway
pub struct GatewayBuilder {
    gateway: String,
    component: String,
}

impl GatewayBuilder {
    /// Builder for the gateway configured under `gateway`
    pub fn new(gateway: impl Into<String>) -> Self {
        let gateway = gateway.into();
        Self {
            component: format!("{gateway}-gateway"),
            gateway,
        }
    }

    fn config<'a>(&self, config: &'a MeshConfig) -> Option<&'a GatewayConfiguration> {
        config.spec.gateways.configs.get(&self.gateway)
    }
}

/// Object name of a gateway, e.g. `istio-ingressgateway`
pub fn gateway_name(gateway: &str) -> String {
    format!("istio-{gateway}gateway")
}

fn service_account_name(gateway: &str) -> String {
    format!("{}-service-account", gateway_name(gateway))
}

fn selector(gateway: &str) -> BTreeMap<String, String> {
    let app = gateway_name(gateway);
    let istio = format!("{gateway}gateway");
    labels(&[("app", app.as_str()), ("istio", istio.as_str())])
}

/// Service ports of a gateway
///
/// Always returns a fresh list. The ingress gateway gets the mesh expansion
/// ports appended when mesh expansion is on.
pub fn service_ports(config: &MeshConfig, gateway: &str) -> Vec<ServicePort> {
    let Some(gw) = config.spec.gateways.configs.get(gateway) else {
        return Vec::new();
    };
    let mut ports = gw.ports.clone();
    if gateway == INGRESS && is_enabled(config.spec.mesh_expansion) {
        ports.extend(mesh_expansion_ports());
    }
    ports
}

/// Service type of a gateway, empty when the gateway is not configured
pub fn service_type(config: &MeshConfig, gateway: &str) -> String {
    config
        .spec
        .gateways
        .configs
        .get(gateway)
        .and_then(|gw| gw.service_type.clone())
        .unwrap_or_default()
}

/// Requested load balancer IP, empty when unset or not configured
pub fn load_balancer_ip(config: &MeshConfig, gateway: &str) -> String {
    config
        .spec
        .gateways
        .configs
        .get(gateway)
        .and_then(|gw| gw.load_balancer_ip.clone())
        .unwrap_or_default()
}

fn non_empty(s: String) -> Option<String> {
    Some(s).filter(|s| !s.is_empty())
}

impl GatewayBuilder {
    fn service(&self, gw: &GatewayConfiguration, config: &MeshConfig) -> Service {
        let name = gateway_name(&self.gateway);
        let selector = selector(&self.gateway);
        let service_labels = gw.service_labels.clone().unwrap_or_default();
        Service {
            metadata: templates::object_meta_with_annotations(
                name,
                merge_labels(&[&service_labels, &selector]),
                gw.service_annotations.clone(),
                config,
            ),
            spec: Some(ServiceSpec {
                load_balancer_ip: non_empty(load_balancer_ip(config, &self.gateway)),
                type_: non_empty(service_type(config, &self.gateway)),
                ports: Some(service_ports(config, &self.gateway)),
                selector: Some(selector),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn deployment(&self, gw: &GatewayConfiguration, config: &MeshConfig) -> Deployment {
        let spec = &config.spec;
        let name = gateway_name(&self.gateway);
        let sds = is_enabled(gw.sds.enabled);

        let mut proxy = templates::container("istio-proxy", &spec.proxy.image, config);
        proxy.args = Some(
            [
                "proxy",
                "router",
                "--domain",
                "$(POD_NAMESPACE).svc.cluster.local",
                "--log_output_level",
                "default:info",
                "--drainDuration",
                "45s",
                "--parentShutdownDuration",
                "1m0s",
                "--connectTimeout",
                "10s",
                "--serviceCluster",
            ]
            .into_iter()
            .map(String::from)
            .chain([
                name.clone(),
                "--zipkinAddress".to_string(),
                spec.tracing.zipkin.address.clone().unwrap_or_default(),
                "--proxyAdminPort".to_string(),
                "15000".to_string(),
                "--statusPort".to_string(),
                "15020".to_string(),
                "--discoveryAddress".to_string(),
                format!("istio-pilot.{}:15010", config.namespace),
            ])
            .collect(),
        );
        proxy.ports = Some(
            service_ports(config, &self.gateway)
                .iter()
                .map(|p| ContainerPort {
                    container_port: p.port,
                    protocol: p.protocol.clone(),
                    ..Default::default()
                })
                .collect(),
        );
        proxy.env = Some(vec![
            env_field("NODE_NAME", "spec.nodeName"),
            env_field("POD_NAME", "metadata.name"),
            env_field("POD_NAMESPACE", "metadata.namespace"),
            env_field("INSTANCE_IP", "status.podIP"),
            env_field("HOST_IP", "status.hostIP"),
            env("ISTIO_META_POD_NAME", "$(POD_NAME)"),
            env("ISTIO_META_CONFIG_NAMESPACE", "$(POD_NAMESPACE)"),
            env("ISTIO_META_ROUTER_MODE", "sni-dnat"),
            env("ISTIO_META_USER_SDS", if sds { "true" } else { "false" }),
        ]);
        proxy.resources =
            templates::resources_or_default(&gw.base.resources, &spec.default_resources);

        let mut containers = vec![proxy];
        let mut volumes = Vec::new();
        if sds {
            let mount = VolumeMount {
                name: SDS_VOLUME.to_string(),
                mount_path: SDS_PATH.to_string(),
                ..Default::default()
            };
            containers[0].volume_mounts = Some(vec![mount.clone()]);

            let mut agent = templates::container(
                &format!("{}-sds", self.gateway),
                &gw.sds.image,
                config,
            );
            agent.env = Some(vec![
                env("ENABLE_WORKLOAD_SDS", "false"),
                env("ENABLE_INGRESS_GATEWAY_SDS", "true"),
                env_field("INGRESS_GATEWAY_NAMESPACE", "metadata.namespace"),
            ]);
            agent.resources = gw.sds.resources.clone();
            agent.volume_mounts = Some(vec![mount]);
            containers.push(agent);

            volumes.push(Volume {
                name: SDS_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            });
        }

        let mut pod = templates::pod_spec(&service_account_name(&self.gateway), containers, &gw.base);
        if !volumes.is_empty() {
            pod.volumes = Some(volumes);
        }

        templates::deployment(
            &name,
            selector(&self.gateway),
            gw.base.replica_count,
            pod,
            config,
        )
    }
}

impl ComponentBuilder for GatewayBuilder {
    fn name(&self) -> &str {
        &self.component
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.gateways.enabled)
            && self.config(config).is_some_and(|gw| is_enabled(gw.enabled))
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let mut set = DesiredObjectSet::new(self.component.clone());
        let Some(gw) = self.config(config) else {
            return Ok(set);
        };
        let name = gateway_name(&self.gateway);
        let selector = selector(&self.gateway);

        set.push(templates::service_account(
            &service_account_name(&self.gateway),
            selector.clone(),
            config,
        ));
        set.push(self.deployment(gw, config));
        set.push(self.service(gw, config));
        set.push(templates::hpa(&name, selector, &gw.base, config));
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::DesiredObject;
    use super::*;
    use crate::crd::IstioSpec;
    use crate::defaults::{default_ingress_gateway_ports, EGRESS};

    fn expansion(enabled: bool) -> MeshConfig {
        config(IstioSpec {
            mesh_expansion: Some(enabled),
            ..Default::default()
        })
    }

    fn port_names(ports: &[ServicePort]) -> Vec<String> {
        ports.iter().filter_map(|p| p.name.clone()).collect()
    }

    #[test]
    fn test_ingress_ports_without_expansion() {
        let config = expansion(false);
        assert_eq!(service_ports(&config, INGRESS), default_ingress_gateway_ports());
    }

    /// Story: mesh expansion adds exactly four control plane ports to ingress
    #[test]
    fn story_mesh_expansion_appends_to_ingress_only() {
        let config = expansion(true);
        let ports = service_ports(&config, INGRESS);
        assert_eq!(ports.len(), default_ingress_gateway_ports().len() + 4);
        assert_eq!(
            port_names(&ports[ports.len() - 4..]),
            vec![
                "tcp-pilot-grpc-tls",
                "tcp-mixer-grpc-tls",
                "tcp-citadel-grpc-tls",
                "tcp-dns-tls"
            ]
        );

        let egress = service_ports(&config, EGRESS);
        assert!(!port_names(&egress).contains(&"tcp-dns-tls".to_string()));
    }

    /// Story: repeated calls never grow the configured port list
    #[test]
    fn story_port_lookup_does_not_alias() {
        let config = expansion(true);
        let first = service_ports(&config, INGRESS);
        let second = service_ports(&config, INGRESS);
        assert_eq!(first, second);
        assert_eq!(
            config.spec.gateways.configs[INGRESS].ports,
            default_ingress_gateway_ports()
        );
    }

    /// Story: an unconfigured gateway name yields empty results
    #[test]
    fn story_unknown_gateway_is_a_no_op() {
        let config = default_config();
        assert!(service_ports(&config, "unknown").is_empty());
        assert_eq!(service_type(&config, "unknown"), "");
        assert_eq!(load_balancer_ip(&config, "unknown"), "");

        let builder = GatewayBuilder::new("unknown");
        assert!(!builder.enabled(&config));
        assert!(builder.build(&config).unwrap().is_empty());
    }

    #[test]
    fn test_default_service_types() {
        let config = default_config();
        assert_eq!(service_type(&config, INGRESS), "LoadBalancer");
        assert_eq!(service_type(&config, EGRESS), "ClusterIP");
    }

    #[test]
    fn test_service_carries_ip_labels_and_annotations() {
        let mut spec = IstioSpec::default();
        let ingress = spec.gateways.configs.entry(INGRESS.to_string()).or_default();
        ingress.load_balancer_ip = Some("10.0.0.10".to_string());
        ingress.service_labels = Some(labels(&[("team", "edge")]));
        ingress.service_annotations = Some(labels(&[("lb", "internal")]));
        let config = config(spec);

        let set = GatewayBuilder::new(INGRESS).build(&config).unwrap();
        let Some(DesiredObject::Service(svc)) = set.find("Service", "istio-ingressgateway") else {
            panic!("no ingress service");
        };
        let meta_labels = svc.metadata.labels.clone().unwrap();
        assert_eq!(meta_labels["team"], "edge");
        assert_eq!(meta_labels["istio"], "ingressgateway");
        assert_eq!(svc.metadata.annotations.clone().unwrap()["lb"], "internal");
        let spec = svc.spec.clone().unwrap();
        assert_eq!(spec.load_balancer_ip.as_deref(), Some("10.0.0.10"));
        assert_eq!(spec.selector.unwrap(), selector(INGRESS));
    }

    #[test]
    fn test_sds_adds_agent_container() {
        let mut spec = IstioSpec::default();
        spec.gateways
            .configs
            .entry(INGRESS.to_string())
            .or_default()
            .sds
            .enabled = Some(true);
        let config = config(spec);

        let set = GatewayBuilder::new(INGRESS).build(&config).unwrap();
        let Some(DesiredObject::Deployment(d)) = set.find("Deployment", "istio-ingressgateway")
        else {
            panic!("no ingress deployment");
        };
        let pod = d.spec.clone().unwrap().template.spec.unwrap();
        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["istio-proxy", "ingress-sds"]);
        assert_eq!(pod.volumes.unwrap()[0].name, SDS_VOLUME);
    }

    #[test]
    fn test_disabled_gateways() {
        let mut spec = IstioSpec::default();
        spec.gateways.enabled = Some(false);
        let config = config(spec);
        assert!(!GatewayBuilder::new(INGRESS).enabled(&config));

        let mut spec = IstioSpec::default();
        spec.gateways
            .configs
            .entry(EGRESS.to_string())
            .or_default()
            .enabled = Some(false);
        let config = super::super::fixtures::config(spec);
        assert!(!GatewayBuilder::new(EGRESS).enabled(&config));
        assert!(GatewayBuilder::new(INGRESS).enabled(&config));
    }
}
