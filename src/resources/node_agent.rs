//! Node agent: per-node SDS server for workload certificates

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{HostPathVolumeSource, PodTemplateSpec, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crd::is_enabled;
use crate::Result;

use super::templates::{self, env, labels, merge_labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "nodeagent";
const SERVICE_ACCOUNT: &str = "istio-nodeagent-service-account";
const CLUSTER_ROLE: &str = "istio-nodeagent-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-nodeagent-cluster-role-binding";
const NAME: &str = "istio-nodeagent";
const SDS_HOST_PATH: &str = "/var/run/sds";

/// Builds the node agent daemon set
pub struct NodeAgentBuilder;

impl NodeAgentBuilder {
    fn daemon_set(&self, config: &MeshConfig) -> DaemonSet {
        let spec = &config.spec;
        let agent = &spec.node_agent;
        let pod_labels = merge_labels(&[&labels(&[("app", COMPONENT)]), &labels(&[("istio", COMPONENT)])]);

        let mut container = templates::container("nodeagent", &agent.image, config);
        container.env = Some(vec![
            env("CA_PROVIDER", "Citadel"),
            env("CA_ADDR", format!("istio-citadel.{}:8060", config.namespace)),
            env("VALID_TOKEN", "true"),
            env("Trust_Domain", "cluster.local"),
        ]);
        container.resources =
            templates::resources_or_default(&agent.base.resources, &spec.default_resources);
        container.volume_mounts = Some(vec![VolumeMount {
            name: "sdsudspath".to_string(),
            mount_path: SDS_HOST_PATH.to_string(),
            ..Default::default()
        }]);

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, vec![container], &agent.base);
        pod.volumes = Some(vec![Volume {
            name: "sdsudspath".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: SDS_HOST_PATH.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]);

        DaemonSet {
            metadata: templates::object_meta(NAME, pod_labels.clone(), config),
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(pod_labels.clone()),
                    ..Default::default()
                },
                update_strategy: Some(DaemonSetUpdateStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    ..Default::default()
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(pod_labels),
                        annotations: Some(templates::default_deploy_annotations()),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

impl ComponentBuilder for NodeAgentBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.node_agent.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let app = labels(&[("app", COMPONENT)]);
        Ok(DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, app.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                app.clone(),
                vec![templates::rule(&[""], &["pods"], &["get"])],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                app,
                config,
            ))
            .with(self.daemon_set(config)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::DesiredObject;
    use super::*;
    use crate::crd::IstioSpec;

    #[test]
    fn test_disabled_by_default() {
        assert!(!NodeAgentBuilder.enabled(&default_config()));

        let mut spec = IstioSpec::default();
        spec.node_agent.enabled = Some(true);
        assert!(NodeAgentBuilder.enabled(&config(spec)));
    }

    #[test]
    fn test_daemon_set_mounts_sds_socket_dir() {
        let set = NodeAgentBuilder.build(&default_config()).unwrap();
        let Some(DesiredObject::DaemonSet(ds)) = set.find("DaemonSet", NAME) else {
            panic!("no node agent daemon set");
        };
        let pod = ds.spec.clone().unwrap().template.spec.unwrap();
        let host_path = pod.volumes.unwrap()[0].host_path.clone().unwrap();
        assert_eq!(host_path.path, SDS_HOST_PATH);
        assert_eq!(pod.node_selector, None);
    }
}
