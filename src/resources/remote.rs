//! The reduced pipeline run against peer clusters
//!
//! A peer only runs what its workloads need locally: the sidecar injector
//! with its mesh ConfigMap, and selector-less services pointing back at the
//! control plane of the primary cluster. Citadel runs only when the peer asks for it.

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointPort, EndpointSubset, Endpoints, Service, ServiceSpec,
};

use crate::crd::{is_enabled, IstioService, RemoteIstio};
use crate::defaults::set_remote_spec_defaults;
use crate::Result;

use super::templates::{self, labels, merge_labels};
use super::{citadel, mesh, sidecar_injector, ComponentBuilder, DesiredObjectSet, MeshConfig};

const ENABLED_SERVICES: &str = "enabled-services";

/// Config of a peer, derived from the primary's resolved config
///
/// Everything but the sidecar injector and an explicitly enabled citadel is
/// switched off. The peer's IP ranges, CA secret and injector sizing replace
/// the primary's.
pub fn remote_config(local: &MeshConfig, remote: &RemoteIstio) -> MeshConfig {
    let mut peer = remote.spec.clone();
    set_remote_spec_defaults(&mut peer);

    let mut spec = local.spec.clone();
    spec.include_ip_ranges = peer.include_ip_ranges;
    spec.exclude_ip_ranges = peer.exclude_ip_ranges;

    spec.pilot.enabled = Some(false);
    spec.galley.enabled = Some(false);
    spec.mixer.enabled = Some(false);
    spec.gateways.enabled = Some(false);
    spec.node_agent.enabled = Some(false);
    spec.istio_coredns.enabled = Some(false);

    spec.citadel.enabled = Some(is_enabled(peer.citadel.enabled));
    spec.citadel.ca_secret_name = peer.citadel.ca_secret_name;

    spec.sidecar_injector.enabled = Some(true);
    spec.sidecar_injector.base.replica_count = peer.sidecar_injector.replica_count;
    if peer.sidecar_injector.resources.is_some() {
        spec.sidecar_injector.base.resources = peer.sidecar_injector.resources;
    }

    MeshConfig {
        spec,
        remote: true,
        ..local.clone()
    }
}

/// Builders run against a peer, in apply order
pub fn builders(remote: &RemoteIstio) -> Vec<Box<dyn ComponentBuilder>> {
    vec![
        Box::new(EnabledServicesBuilder::new(remote.spec.enabled_services.clone())),
        Box::new(mesh::MeshConfigBuilder::new(&[])),
        Box::new(citadel::CitadelBuilder),
        Box::new(sidecar_injector::SidecarInjectorBuilder),
    ]
}

/// Control plane services the peer reaches by address
pub struct EnabledServicesBuilder {
    services: Vec<IstioService>,
}

impl EnabledServicesBuilder {
    /// Builder for the given services
    pub fn new(services: Vec<IstioService>) -> Self {
        Self { services }
    }
}

fn service(svc: &IstioService, config: &MeshConfig) -> Service {
    let svc_labels = merge_labels(&[
        &svc.labels.clone().unwrap_or_default(),
        &labels(&[("istio-remote", "true")]),
    ]);
    Service {
        metadata: templates::object_meta(&svc.name, svc_labels, config),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            ports: Some(
                svc.ports
                    .iter()
                    .map(|p| templates::port(&p.name, p.port, "TCP"))
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn endpoints(svc: &IstioService, config: &MeshConfig) -> Endpoints {
    Endpoints {
        metadata: templates::object_meta(
            &svc.name,
            labels(&[("istio-remote", "true")]),
            config,
        ),
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                svc.pod_ips
                    .iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.clone(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                svc.ports
                    .iter()
                    .map(|p| EndpointPort {
                        name: Some(p.name.clone()),
                        port: p.port,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

impl ComponentBuilder for EnabledServicesBuilder {
    fn name(&self) -> &str {
        ENABLED_SERVICES
    }

    fn enabled(&self, _config: &MeshConfig) -> bool {
        !self.services.is_empty()
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let mut set = DesiredObjectSet::new(ENABLED_SERVICES);
        for svc in &self.services {
            set.push(service(svc, config));
            set.push(endpoints(svc, config));
        }
        Ok(set)
    }
}
