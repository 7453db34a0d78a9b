//! Pilot: service discovery and proxy configuration

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerPort, HTTPGetAction, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::crd::is_enabled;
use crate::Result;

use super::templates::{self, env, env_field, labels, merge_labels};
use super::{mesh, ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "pilot";
const SERVICE_ACCOUNT: &str = "istio-pilot-service-account";
const CLUSTER_ROLE: &str = "istio-pilot-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-pilot-cluster-role-binding";
const NAME: &str = "istio-pilot";

/// Builds discovery
pub struct PilotBuilder;

fn component_labels() -> BTreeMap<String, String> {
    labels(&[("app", "istio-pilot")])
}

fn selector() -> BTreeMap<String, String> {
    labels(&[("istio", "pilot")])
}

fn discovery_args(config: &MeshConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "discovery",
        "--meshConfig=/etc/istio/config/mesh",
        "--networksConfig=/etc/istio/config/meshNetworks",
        "--monitoringAddr=:15014",
        "--log_output_level=default:info",
        "--domain",
        "cluster.local",
        "--keepaliveMaxServerConnectionAge",
        "30m",
    ]
    .map(String::from)
    .to_vec();
    if !is_enabled(config.spec.pilot.sidecar) {
        args.extend(["--secureGrpcAddr".to_string(), String::new()]);
    }
    args
}

impl PilotBuilder {
    fn deployment(&self, config: &MeshConfig) -> Deployment {
        let spec = &config.spec;
        let pilot = &spec.pilot;

        let mut discovery = templates::container("discovery", &pilot.image, config);
        discovery.args = Some(discovery_args(config));
        discovery.ports = Some(
            [8080, 15010, 15011]
                .map(|port| ContainerPort {
                    container_port: port,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                })
                .to_vec(),
        );
        discovery.readiness_probe = Some(Probe {
            http_get: Some(HTTPGetAction {
                path: Some("/ready".to_string()),
                port: IntOrString::Int(8080),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(30),
            timeout_seconds: Some(5),
            ..Default::default()
        });
        discovery.env = Some(vec![
            env_field("POD_NAME", "metadata.name"),
            env_field("POD_NAMESPACE", "metadata.namespace"),
            env("GODEBUG", "gctrace=1"),
            env("PILOT_PUSH_THROTTLE", "100"),
            env(
                "PILOT_TRACE_SAMPLING",
                pilot.trace_sampling.unwrap_or_default().to_string(),
            ),
            env("PILOT_DISABLE_XDS_MARSHALING_TO_ANY", "1"),
        ]);
        discovery.resources =
            templates::resources_or_default(&pilot.base.resources, &spec.default_resources);
        discovery.volume_mounts = Some(vec![templates::read_only_mount(
            "config-volume",
            "/etc/istio/config",
        )]);

        let mut containers = vec![discovery];
        if is_enabled(pilot.sidecar) {
            let mut proxy = templates::container("istio-proxy", &spec.proxy.image, config);
            proxy.args = Some(
                [
                    "proxy",
                    "--domain",
                    "$(POD_NAMESPACE).svc.cluster.local",
                    "--serviceCluster",
                    NAME,
                    "--templateFile",
                    "/etc/istio/proxy/envoy_pilot.yaml.tmpl",
                    "--controlPlaneAuthPolicy",
                    "NONE",
                ]
                .map(String::from)
                .to_vec(),
            );
            proxy.ports = Some(
                [15003, 15005, 15007, 15011]
                    .map(|port| ContainerPort {
                        container_port: port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .to_vec(),
            );
            proxy.env = Some(vec![
                env_field("POD_NAME", "metadata.name"),
                env_field("POD_NAMESPACE", "metadata.namespace"),
                env_field("INSTANCE_IP", "status.podIP"),
            ]);
            proxy.resources = spec.proxy.resources.clone();
            containers.push(proxy);
        }

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, containers, &pilot.base);
        pod.volumes = Some(vec![templates::config_map_volume("config-volume", mesh::NAME)]);

        templates::deployment(
            NAME,
            merge_labels(&[&component_labels(), &selector()]),
            pilot.base.replica_count,
            pod,
            config,
        )
    }
}

impl ComponentBuilder for PilotBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.pilot.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let labels = component_labels();
        let selected = merge_labels(&[&labels, &selector()]);
        let mut set = DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, labels.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                labels.clone(),
                vec![
                    templates::rule(&["config.istio.io"], &["*"], &["*"]),
                    templates::rule(&["rbac.istio.io"], &["*"], &["get", "watch", "list"]),
                    templates::rule(&["networking.istio.io"], &["*"], &["*"]),
                    templates::rule(&["authentication.istio.io"], &["*"], &["*"]),
                    templates::rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"], &["*"]),
                    templates::rule(&["extensions"], &["ingresses", "ingresses/status"], &["*"]),
                    templates::rule(&[""], &["configmaps"], &["create", "get", "list", "watch", "update"]),
                    templates::rule(&[""], &["endpoints", "pods", "services", "namespaces", "nodes", "secrets"], &["get", "list", "watch"]),
                ],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                labels,
                config,
            ))
            .with(self.deployment(config))
            .with(templates::service(
                NAME,
                selected.clone(),
                selector(),
                vec![
                    templates::port("grpc-xds", 15010, "TCP"),
                    templates::port("https-xds", 15011, "TCP"),
                    templates::port("http-legacy-discovery", 8080, "TCP"),
                    templates::port("http-monitoring", 15014, "TCP"),
                ],
                config,
            ))
            .with(templates::hpa(NAME, selected.clone(), &config.spec.pilot.base, config));
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

    fn containers(set: &DesiredObjectSet) -> Vec<String> {
        let Some(DesiredObject::Deployment(d)) = set.find("Deployment", NAME) else {
            panic!("no pilot deployment");
        };
        d.spec
            .clone()
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers
            .into_iter()
            .map(|c| c.name)
            .collect()
    }

    #[test]
    fn test_default_pilot_has_sidecar_and_hpa() {
        let set = PilotBuilder.build(&default_config()).unwrap();
        assert_eq!(containers(&set), vec!["discovery", "istio-proxy"]);
        assert!(set.find("HorizontalPodAutoscaler", NAME).is_some());
        assert!(set.find("PodDisruptionBudget", NAME).is_none());
    }

    #[test]
    fn test_no_sidecar_disables_secure_grpc() {
        let mut spec = IstioSpec::default();
        spec.pilot.sidecar = Some(false);
        let config = config(spec);
        let set = PilotBuilder.build(&config).unwrap();
        assert_eq!(containers(&set), vec!["discovery"]);
        assert!(discovery_args(&config).contains(&"--secureGrpcAddr".to_string()));
    }

    #[test]
    fn test_pdb_follows_mesh_default() {
        let mut spec = IstioSpec::default();
        spec.default_pod_disruption_budget.enabled = Some(true);
        let set = PilotBuilder.build(&config(spec)).unwrap();
        assert!(set.find("PodDisruptionBudget", NAME).is_some());
    }

    #[test]
    fn test_discovery_reads_mounted_mesh_config() {
        let set = PilotBuilder.build(&default_config()).unwrap();
        let Some(DesiredObject::Deployment(d)) = set.find("Deployment", NAME) else {
            panic!("no pilot deployment");
        };
        let pod = d.spec.clone().unwrap().template.spec.unwrap();
        let volumes = pod.volumes.clone().unwrap();
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, mesh::NAME);
        let discovery = &pod.containers[0];
        let mounts = discovery.volume_mounts.clone().unwrap();
        assert_eq!(mounts[0].name, volumes[0].name);
        let args = discovery.args.clone().unwrap();
        assert!(args.contains(&format!("--meshConfig={}/{}", mounts[0].mount_path, mesh::MESH_KEY)));
    }

    #[test]
    fn test_disabled_pilot() {
        let mut spec = IstioSpec::default();
        spec.pilot.enabled = Some(false);
        assert!(!PilotBuilder.enabled(&config(spec)));
        assert!(PilotBuilder.enabled(&default_config()));
    }
}
