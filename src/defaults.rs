//! Defaulting pass for mesh specifications
//!
//! [`set_defaults`] and [`set_remote_defaults`] only ever fill fields the
//! user left unset, so running them any number of times yields the same
//! object. [`resolve`] is the pure form used by the controllers.
//!
//! Default tables are functions returning fresh values; nothing here is
//! shared mutable state.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ResourceRequirements, ServicePort};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{GatewayConfiguration, Istio, IstioSpec, RemoteIstio, RemoteIstioSpec, TracerType};
use crate::{Error, Result};

const IMAGE_HUB: &str = "docker.io/istio";
const IMAGE_VERSION: &str = "1.2.5";

/// Default init-CNI installer image
pub const DEFAULT_INIT_CNI_IMAGE: &str = "gcr.io/istio-release/install-cni:master-latest-daily";
/// Default CoreDNS image
pub const DEFAULT_COREDNS_IMAGE: &str = "coredns/coredns:1.1.2";
/// Default CoreDNS Istio plugin image
pub const DEFAULT_COREDNS_PLUGIN_IMAGE: &str = "docker.io/istio/coredns-plugin:0.2-istio-1.1";

/// Default outbound capture ranges
pub const DEFAULT_INCLUDE_IP_RANGES: &str = "*";
/// Default replica count
pub const DEFAULT_REPLICA_COUNT: i32 = 1;
/// Default lower autoscaling bound
pub const DEFAULT_MIN_REPLICAS: i32 = 1;
/// Default upper autoscaling bound
pub const DEFAULT_MAX_REPLICAS: i32 = 5;
/// Default pilot trace sampling percentage
pub const DEFAULT_TRACE_SAMPLING: f64 = 1.0;
/// Service type of every gateway except egress
pub const DEFAULT_INGRESS_SERVICE_TYPE: &str = "LoadBalancer";
/// Service type of the egress gateway
pub const DEFAULT_EGRESS_SERVICE_TYPE: &str = "ClusterIP";
/// Default image pull policy
pub const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
/// Default outbound traffic policy
pub const OUTBOUND_ALLOW_ANY: &str = "ALLOW_ANY";

const INIT_CNI_BIN_DIR: &str = "/opt/cni/bin";
const INIT_CNI_CONF_DIR: &str = "/etc/cni/net.d";
const INIT_CNI_LOG_LEVEL: &str = "info";
const DATADOG_ADDRESS: &str = "$(HOST_IP):8126";

/// Name of the ingress gateway
pub const INGRESS: &str = "ingress";
/// Name of the egress gateway
pub const EGRESS: &str = "egress";

/// Fully qualified image of an Istio component at the default version
pub fn istio_image(name: &str) -> String {
    format!("{IMAGE_HUB}/{name}:{IMAGE_VERSION}")
}

fn quantities(pairs: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

/// Mesh-wide resource baseline
pub fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(&[("cpu", "10m")])),
        ..Default::default()
    }
}

/// Proxy resource baseline, used when the user sets no mesh-wide baseline
pub fn default_proxy_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(&[("cpu", "100m"), ("memory", "128Mi")])),
        limits: Some(quantities(&[("cpu", "2000m"), ("memory", "1024Mi")])),
        ..Default::default()
    }
}

/// Proxy init container resource baseline
pub fn default_init_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(quantities(&[("cpu", "10m"), ("memory", "10Mi")])),
        limits: Some(quantities(&[("cpu", "100m"), ("memory", "50Mi")])),
        ..Default::default()
    }
}

/// TCP service port with target port equal to the port
pub fn tcp_port(name: &str, port: i32, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        node_port,
        ..Default::default()
    }
}

/// Default ports of the ingress gateway
pub fn default_ingress_gateway_ports() -> Vec<ServicePort> {
    vec![
        tcp_port("status-port", 15020, Some(31460)),
        tcp_port("http2", 80, Some(31380)),
        tcp_port("https", 443, Some(31390)),
        tcp_port("tls", 15443, Some(31450)),
    ]
}

/// Default ports of the egress gateway
pub fn default_egress_gateway_ports() -> Vec<ServicePort> {
    vec![
        tcp_port("http2", 80, None),
        tcp_port("https", 443, None),
        tcp_port("tls", 15443, None),
    ]
}

/// Control plane ports exposed on the ingress gateway in mesh expansion mode
pub fn mesh_expansion_ports() -> Vec<ServicePort> {
    vec![
        tcp_port("tcp-pilot-grpc-tls", 15011, Some(31470)),
        tcp_port("tcp-mixer-grpc-tls", 15004, Some(31480)),
        tcp_port("tcp-citadel-grpc-tls", 8060, Some(31490)),
        tcp_port("tcp-dns-tls", 853, Some(31500)),
    ]
}

fn default_str(field: &mut Option<String>, value: impl Into<String>) {
    if field.as_deref().map_or(true, str::is_empty) {
        *field = Some(value.into());
    }
}

fn default_count(field: &mut Option<i32>, value: i32) {
    if field.map_or(true, |v| v == 0) {
        *field = Some(value);
    }
}

fn default_flag(field: &mut Option<bool>, value: bool) {
    field.get_or_insert(value);
}

/// Fill every unset field of an `Istio` resource
pub fn set_defaults(config: &mut Istio) {
    let namespace = config.namespace().unwrap_or_default();
    set_spec_defaults(&mut config.spec, &namespace);
}

/// Resolve a spec without touching the input
pub fn resolve(spec: &IstioSpec, namespace: &str) -> IstioSpec {
    let mut resolved = spec.clone();
    set_spec_defaults(&mut resolved, namespace);
    resolved
}

/// Fill every unset field of a spec living in `namespace`
pub fn set_spec_defaults(spec: &mut IstioSpec, namespace: &str) {
    default_str(&mut spec.include_ip_ranges, DEFAULT_INCLUDE_IP_RANGES);

    // Must run before default_resources is filled: the proxy baseline only
    // applies when the user did not set a mesh-wide one.
    if spec.proxy.resources.is_none() {
        spec.proxy.resources = Some(if spec.default_resources.is_none() {
            default_proxy_resources()
        } else {
            default_resources()
        });
    }
    if spec.default_resources.is_none() {
        spec.default_resources = Some(default_resources());
    }

    let pilot = &mut spec.pilot;
    default_flag(&mut pilot.enabled, true);
    default_str(&mut pilot.image, istio_image("pilot"));
    default_flag(&mut pilot.sidecar, true);
    default_count(&mut pilot.base.replica_count, DEFAULT_REPLICA_COUNT);
    default_count(&mut pilot.base.min_replicas, DEFAULT_MIN_REPLICAS);
    default_count(&mut pilot.base.max_replicas, DEFAULT_MAX_REPLICAS);
    if pilot.trace_sampling.map_or(true, |v| v == 0.0) {
        pilot.trace_sampling = Some(DEFAULT_TRACE_SAMPLING);
    }

    default_flag(&mut spec.citadel.enabled, true);
    default_str(&mut spec.citadel.image, istio_image("citadel"));

    default_flag(&mut spec.galley.enabled, true);
    default_str(&mut spec.galley.image, istio_image("galley"));
    default_count(&mut spec.galley.base.replica_count, DEFAULT_REPLICA_COUNT);

    default_flag(&mut spec.gateways.enabled, true);
    for name in [INGRESS, EGRESS] {
        spec.gateways.configs.entry(name.to_string()).or_default();
    }
    for (name, gateway) in spec.gateways.configs.iter_mut() {
        set_gateway_defaults(name, gateway);
    }

    let mixer = &mut spec.mixer;
    default_flag(&mut mixer.enabled, true);
    default_str(&mut mixer.image, istio_image("mixer"));
    default_count(&mut mixer.base.replica_count, DEFAULT_REPLICA_COUNT);
    default_count(&mut mixer.base.min_replicas, DEFAULT_MIN_REPLICAS);
    default_count(&mut mixer.base.max_replicas, DEFAULT_MAX_REPLICAS);

    let injector = &mut spec.sidecar_injector;
    default_flag(&mut injector.enabled, true);
    default_flag(&mut injector.auto_injection_policy_enabled, true);
    default_str(&mut injector.image, istio_image("sidecar_injector"));
    default_count(&mut injector.base.replica_count, DEFAULT_REPLICA_COUNT);
    let cni = &mut injector.init_cni_configuration;
    default_flag(&mut cni.enabled, false);
    default_str(&mut cni.image, DEFAULT_INIT_CNI_IMAGE);
    default_str(&mut cni.bin_dir, INIT_CNI_BIN_DIR);
    default_str(&mut cni.conf_dir, INIT_CNI_CONF_DIR);
    if cni.exclude_namespaces.is_none() {
        cni.exclude_namespaces = Some(vec![namespace.to_string()]);
    }
    default_str(&mut cni.log_level, INIT_CNI_LOG_LEVEL);
    if injector.init.resources.is_none() {
        injector.init.resources = Some(default_init_resources());
    }

    default_flag(&mut spec.sds.enabled, false);

    default_flag(&mut spec.node_agent.enabled, false);
    default_str(&mut spec.node_agent.image, istio_image("node-agent-k8s"));

    default_str(&mut spec.proxy.image, istio_image("proxyv2"));
    default_str(&mut spec.proxy_init.image, istio_image("proxy_init"));
    default_str(&mut spec.proxy.component_log_level, "misc:error");
    default_str(&mut spec.proxy.log_level, "warning");
    default_str(&mut spec.proxy.dns_refresh_rate, "300s");

    default_flag(&mut spec.default_pod_disruption_budget.enabled, false);
    default_str(&mut spec.outbound_traffic_policy.mode, OUTBOUND_ALLOW_ANY);

    let tracing = &mut spec.tracing;
    default_flag(&mut tracing.enabled, true);
    tracing.tracer.get_or_insert(TracerType::Zipkin);
    default_str(&mut tracing.datadog.address, DATADOG_ADDRESS);
    default_str(&mut tracing.zipkin.address, format!("zipkin.{namespace}:9411"));

    default_flag(&mut spec.multi_mesh, false);

    let coredns = &mut spec.istio_coredns;
    default_flag(&mut coredns.enabled, false);
    default_str(&mut coredns.image, DEFAULT_COREDNS_IMAGE);
    default_str(&mut coredns.plugin_image, DEFAULT_COREDNS_PLUGIN_IMAGE);
    default_count(&mut coredns.base.replica_count, DEFAULT_REPLICA_COUNT);

    default_str(&mut spec.image_pull_policy, DEFAULT_IMAGE_PULL_POLICY);
    default_flag(&mut spec.mesh_expansion, false);
    default_flag(&mut spec.use_mcp, true);
}

fn set_gateway_defaults(name: &str, gateway: &mut GatewayConfiguration) {
    default_flag(&mut gateway.enabled, true);
    default_count(&mut gateway.base.replica_count, DEFAULT_REPLICA_COUNT);
    default_count(&mut gateway.base.min_replicas, DEFAULT_MIN_REPLICAS);
    default_count(&mut gateway.base.max_replicas, DEFAULT_MAX_REPLICAS);
    default_flag(&mut gateway.sds.enabled, false);
    default_str(&mut gateway.sds.image, istio_image("node-agent-k8s"));
    default_str(
        &mut gateway.service_type,
        if name == EGRESS {
            DEFAULT_EGRESS_SERVICE_TYPE
        } else {
            DEFAULT_INGRESS_SERVICE_TYPE
        },
    );
    if gateway.ports.is_empty() {
        match name {
            EGRESS => gateway.ports = default_egress_gateway_ports(),
            INGRESS => gateway.ports = default_ingress_gateway_ports(),
            _ => {}
        }
    }
}

/// Fill every unset field of a `RemoteIstio` resource
pub fn set_remote_defaults(remote: &mut RemoteIstio) {
    set_remote_spec_defaults(&mut remote.spec);
}

/// Fill every unset field of a remote spec
pub fn set_remote_spec_defaults(spec: &mut RemoteIstioSpec) {
    default_str(&mut spec.include_ip_ranges, DEFAULT_INCLUDE_IP_RANGES);
    default_count(&mut spec.sidecar_injector.replica_count, DEFAULT_REPLICA_COUNT);
}

/// Check constraints that defaulting cannot repair
pub fn validate(spec: &IstioSpec) -> Result<()> {
    check_bounds("pilot", spec.pilot.base.min_replicas, spec.pilot.base.max_replicas)?;
    check_bounds("mixer", spec.mixer.base.min_replicas, spec.mixer.base.max_replicas)?;
    for (name, gateway) in &spec.gateways.configs {
        check_bounds(
            &format!("{name}-gateway"),
            gateway.base.min_replicas,
            gateway.base.max_replicas,
        )?;
    }
    if let Some(sampling) = spec.pilot.trace_sampling {
        if !(0.0..=100.0).contains(&sampling) {
            return Err(Error::config(
                "pilot",
                format!("traceSampling {sampling} must be between 0 and 100"),
            ));
        }
    }
    Ok(())
}

fn check_bounds(component: &str, min: Option<i32>, max: Option<i32>) -> Result<()> {
    match (min, max) {
        (Some(min), _) if min < 0 => Err(Error::config(
            component,
            format!("minReplicas {min} must not be negative"),
        )),
        (Some(min), Some(max)) if min > max => Err(Error::config(
            component,
            format!("minReplicas {min} exceeds maxReplicas {max}"),
        )),
        _ => Ok(()),
    }
}
