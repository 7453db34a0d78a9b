//! Citadel: the mesh certificate authority

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ExecAction, Probe, SecretVolumeSource, Volume, VolumeMount};

use crate::crd::is_enabled;
use crate::Result;

use super::templates::{self, labels, merge_labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "citadel";
const SERVICE_ACCOUNT: &str = "istio-citadel-service-account";
const CLUSTER_ROLE: &str = "istio-citadel-cluster";
const CLUSTER_ROLE_BINDING: &str = "istio-citadel-cluster-role-binding";
const DEPLOYMENT: &str = "istio-citadel";
const SERVICE: &str = "istio-citadel";

const CA_VOLUME: &str = "cacerts";
const CA_MOUNT_PATH: &str = "/etc/cacerts";
const LIVENESS_PATH: &str = "/tmp/ca.liveness";

/// Builds the certificate authority
pub struct CitadelBuilder;

fn component_labels() -> BTreeMap<String, String> {
    labels(&[("app", "security")])
}

fn selector() -> BTreeMap<String, String> {
    labels(&[("istio", "citadel")])
}

/// Command line of the citadel container
pub fn citadel_args(config: &MeshConfig) -> Vec<String> {
    let spec = &config.spec;
    let ns = &config.namespace;
    let mut args = Vec::new();

    if is_enabled(spec.sds.enabled) {
        args.push("--sds-enabled=true".to_string());
    }
    args.extend([
        "--append-dns-names=true".to_string(),
        "--grpc-port=8060".to_string(),
        format!("--citadel-storage-namespace={ns}"),
        format!("--custom-dns-names=istio-pilot-service-account.{ns}:istio-pilot.{ns}"),
        "--monitoring-port=15014".to_string(),
    ]);

    match ca_secret(config) {
        None => args.push("--self-signed-ca=true".to_string()),
        Some(_) => args.extend(
            [
                "--self-signed-ca=false",
                "--signing-cert=/etc/cacerts/ca-cert.pem",
                "--signing-key=/etc/cacerts/ca-key.pem",
                "--root-cert=/etc/cacerts/root-cert.pem",
                "--cert-chain=/etc/cacerts/cert-chain.pem",
            ]
            .map(String::from),
        ),
    }

    if is_enabled(spec.citadel.health_check) {
        args.extend([
            format!("--liveness-probe-path={LIVENESS_PATH}"),
            "--liveness-probe-interval=60s".to_string(),
            "--probe-check-interval=15s".to_string(),
        ]);
    }

    if let Some(ttl) = spec.citadel.workload_cert_ttl.as_deref().filter(|s| !s.is_empty()) {
        args.extend(["--workload-cert-ttl".to_string(), ttl.to_string()]);
    }
    if let Some(ttl) = spec
        .citadel
        .max_workload_cert_ttl
        .as_deref()
        .filter(|s| !s.is_empty())
    {
        args.extend(["--max-workload-cert-ttl".to_string(), ttl.to_string()]);
    }

    args
}

fn ca_secret(config: &MeshConfig) -> Option<&str> {
    config
        .spec
        .citadel
        .ca_secret_name
        .as_deref()
        .filter(|s| !s.is_empty())
}

fn liveness_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(
                [
                    "/usr/local/bin/istio_ca",
                    "probe",
                    "--probe-path=/tmp/ca.liveness",
                    "--interval=125s",
                ]
                .map(String::from)
                .to_vec(),
            ),
        }),
        initial_delay_seconds: Some(60),
        period_seconds: Some(60),
        failure_threshold: Some(30),
        success_threshold: Some(1),
        timeout_seconds: Some(1),
        ..Default::default()
    }
}

impl CitadelBuilder {
    fn deployment(&self, config: &MeshConfig) -> Deployment {
        let citadel = &config.spec.citadel;

        let mut container = templates::container("citadel", &citadel.image, config);
        container.args = Some(citadel_args(config));
        container.resources =
            templates::resources_or_default(&citadel.base.resources, &config.spec.default_resources);
        if is_enabled(citadel.health_check) {
            container.liveness_probe = Some(liveness_probe());
        }
        if ca_secret(config).is_some() {
            container.volume_mounts = Some(vec![VolumeMount {
                name: CA_VOLUME.to_string(),
                mount_path: CA_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            }]);
        }

        let mut pod = templates::pod_spec(SERVICE_ACCOUNT, vec![container], &citadel.base);
        if let Some(secret) = ca_secret(config) {
            pod.volumes = Some(vec![Volume {
                name: CA_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.to_string()),
                    optional: Some(false),
                    default_mode: Some(420),
                    ..Default::default()
                }),
                ..Default::default()
            }]);
        }

        templates::deployment(
            DEPLOYMENT,
            merge_labels(&[&component_labels(), &selector()]),
            Some(1),
            pod,
            config,
        )
    }
}

impl ComponentBuilder for CitadelBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, config: &MeshConfig) -> bool {
        is_enabled(config.spec.citadel.enabled)
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let labels = component_labels();
        Ok(DesiredObjectSet::new(COMPONENT)
            .with(templates::service_account(SERVICE_ACCOUNT, labels.clone(), config))
            .with(templates::cluster_role(
                CLUSTER_ROLE,
                labels.clone(),
                vec![
                    templates::rule(&[""], &["configmaps"], &["create", "get", "update"]),
                    templates::rule(&[""], &["secrets"], &["create", "get", "watch", "list", "update", "delete"]),
                    templates::rule(&[""], &["serviceaccounts", "services"], &["get", "watch", "list"]),
                    templates::rule(&["authentication.k8s.io"], &["tokenreviews"], &["create"]),
                ],
            ))
            .with(templates::cluster_role_binding(
                CLUSTER_ROLE_BINDING,
                CLUSTER_ROLE,
                SERVICE_ACCOUNT,
                labels.clone(),
                config,
            ))
            .with(templates::service(
                SERVICE,
                merge_labels(&[&labels, &selector()]),
                selector(),
                vec![
                    templates::port("grpc-citadel", 8060, "TCP"),
                    templates::port("http-monitoring", 15014, "TCP"),
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
    use k8s_openapi::api::core::v1::{Container, PodSpec, Toleration};

    fn spec_with(f: impl FnOnce(&mut IstioSpec)) -> MeshConfig {
        let mut spec = IstioSpec::default();
        f(&mut spec);
        config(spec)
    }

    fn deployment(config: &MeshConfig) -> Deployment {
        let set = CitadelBuilder.build(config).unwrap();
        match set.find("Deployment", DEPLOYMENT) {
            Some(DesiredObject::Deployment(d)) => d.clone(),
            other => panic!("no citadel deployment: {other:?}"),
        }
    }

    fn pod(d: &Deployment) -> PodSpec {
        d.spec.clone().unwrap().template.spec.unwrap()
    }

    fn container(d: &Deployment) -> Container {
        pod(d).containers[0].clone()
    }

    /// Story: without a CA secret citadel signs with its own root
    #[test]
    fn story_self_signed_by_default() {
        let config = default_config();
        let args = citadel_args(&config);
        assert_eq!(
            args,
            vec![
                "--append-dns-names=true",
                "--grpc-port=8060",
                "--citadel-storage-namespace=istio-system",
                "--custom-dns-names=istio-pilot-service-account.istio-system:istio-pilot.istio-system",
                "--monitoring-port=15014",
                "--self-signed-ca=true",
            ]
        );

        let d = deployment(&config);
        assert!(container(&d).volume_mounts.is_none());
        assert!(pod(&d).volumes.is_none());
    }

    /// Story: a CA secret switches to the mounted signing material
    #[test]
    fn story_ca_secret_mounts_cacerts() {
        let config = spec_with(|s| s.citadel.ca_secret_name = Some("cacerts".to_string()));
        let args = citadel_args(&config);
        assert!(args.contains(&"--self-signed-ca=false".to_string()));
        assert!(args.contains(&"--signing-key=/etc/cacerts/ca-key.pem".to_string()));
        assert!(!args.contains(&"--self-signed-ca=true".to_string()));

        let d = deployment(&config);
        let mounts = container(&d).volume_mounts.unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_path, CA_MOUNT_PATH);
        assert_eq!(mounts[0].read_only, Some(true));

        let volumes = pod(&d).volumes.unwrap();
        let secret = volumes[0].secret.clone().unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("cacerts"));
        assert_eq!(secret.optional, Some(false));
        assert_eq!(secret.default_mode, Some(420));
    }

    #[test]
    fn test_empty_ca_secret_is_self_signed() {
        let config = spec_with(|s| s.citadel.ca_secret_name = Some(String::new()));
        assert!(citadel_args(&config).contains(&"--self-signed-ca=true".to_string()));
    }

    #[test]
    fn test_sds_flag_comes_first() {
        let config = spec_with(|s| s.sds.enabled = Some(true));
        assert_eq!(citadel_args(&config)[0], "--sds-enabled=true");
    }

    #[test]
    fn test_health_check_adds_probe() {
        let config = spec_with(|s| s.citadel.health_check = Some(true));
        let args = citadel_args(&config);
        assert!(args.contains(&"--liveness-probe-path=/tmp/ca.liveness".to_string()));

        let probe = container(&deployment(&config)).liveness_probe.unwrap();
        assert_eq!(probe.initial_delay_seconds, Some(60));
        assert_eq!(probe.period_seconds, Some(60));
        assert_eq!(probe.failure_threshold, Some(30));
        assert_eq!(probe.timeout_seconds, Some(1));
    }

    #[test]
    fn test_cert_ttls_are_separate_args() {
        let config = spec_with(|s| {
            s.citadel.workload_cert_ttl = Some("24h".to_string());
            s.citadel.max_workload_cert_ttl = Some("48h".to_string());
        });
        let args = citadel_args(&config);
        let tail: Vec<&str> = args[args.len() - 4..].iter().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec!["--workload-cert-ttl", "24h", "--max-workload-cert-ttl", "48h"]
        );
    }

    #[test]
    fn test_placement_passes_through() {
        let config = spec_with(|s| {
            s.citadel.base.tolerations = Some(vec![Toleration {
                key: Some("dedicated".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]);
        });
        let d = deployment(&config);
        assert_eq!(pod(&d).tolerations, config.spec.citadel.base.tolerations);
        assert_eq!(pod(&d).service_account_name.as_deref(), Some(SERVICE_ACCOUNT));
        assert_eq!(d.spec.unwrap().replicas, Some(1));
    }

    #[test]
    fn test_object_order() {
        let set = CitadelBuilder.build(&default_config()).unwrap();
        let kinds: Vec<&str> = set.objects.iter().map(|o| o.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                "ServiceAccount",
                "ClusterRole",
                "ClusterRoleBinding",
                "Service",
                "Deployment"
            ]
        );
    }
}
