//! The mesh-wide `istio` ConfigMap
//!
//! Pilot, galley and the sidecar injector all read the mesh configuration
//! from this ConfigMap. A rendered component that ships its own `istio`
//! ConfigMap takes precedence and this builder steps aside.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use serde_json::{json, Map, Value};

use crate::crd::{is_enabled, TracerType};
use crate::{Error, Result};

use super::rendered::RenderedComponent;
use super::templates::{self, labels};
use super::{ComponentBuilder, DesiredObjectSet, MeshConfig};

const COMPONENT: &str = "mesh-config";

/// Name of the mesh ConfigMap
pub const NAME: &str = "istio";
/// Key holding the mesh configuration
pub const MESH_KEY: &str = "mesh";
/// Key holding the mesh networks
pub const NETWORKS_KEY: &str = "meshNetworks";

/// Builds the mesh ConfigMap unless a rendered component provides it
pub struct MeshConfigBuilder {
    provided: bool,
}

impl MeshConfigBuilder {
    /// Builder that yields to any rendered `istio` ConfigMap
    pub fn new(rendered: &[RenderedComponent]) -> Self {
        Self {
            provided: rendered.iter().any(|r| r.provides("ConfigMap", NAME)),
        }
    }
}

fn tracer(config: &MeshConfig) -> Value {
    let tracing = &config.spec.tracing;
    match tracing.tracer.clone().unwrap_or_default() {
        TracerType::Zipkin => json!({ "zipkin": { "address": tracing.zipkin.address } }),
        TracerType::Datadog => json!({ "datadog": { "address": tracing.datadog.address } }),
        TracerType::Lightstep => json!({
            "lightstep": {
                "address": tracing.lightstep.address,
                "accessToken": tracing.lightstep.access_token,
                "secure": is_enabled(tracing.lightstep.secure),
                "cacertPath": "/etc/lightstep/cacert.pem",
            }
        }),
    }
}

/// Mesh configuration document
fn mesh(config: &MeshConfig) -> Value {
    let spec = &config.spec;
    let ns = &config.namespace;

    let mut proxy = Map::new();
    proxy.insert("connectTimeout".into(), json!("10s"));
    proxy.insert("configPath".into(), json!("/etc/istio/proxy"));
    proxy.insert("binaryPath".into(), json!("/usr/local/bin/envoy"));
    proxy.insert("serviceCluster".into(), json!("istio-proxy"));
    proxy.insert("drainDuration".into(), json!("45s"));
    proxy.insert("parentShutdownDuration".into(), json!("1m0s"));
    proxy.insert("proxyAdminPort".into(), json!(15000));
    proxy.insert("concurrency".into(), json!(2));
    proxy.insert("controlPlaneAuthPolicy".into(), json!("NONE"));
    proxy.insert("discoveryAddress".into(), json!(format!("istio-pilot.{ns}:15010")));
    if is_enabled(spec.tracing.enabled) {
        proxy.insert("tracing".into(), tracer(config));
    }

    let mut mesh = Map::new();
    mesh.insert("disablePolicyChecks".into(), json!(!is_enabled(spec.mixer.enabled)));
    mesh.insert("enableTracing".into(), json!(is_enabled(spec.tracing.enabled)));
    mesh.insert("accessLogFile".into(), json!("/dev/stdout"));
    mesh.insert("ingressService".into(), json!("istio-ingressgateway"));
    mesh.insert("ingressControllerMode".into(), json!("OFF"));
    mesh.insert("rootNamespace".into(), json!(ns));
    mesh.insert("sdsUdsPath".into(), json!(spec.sds.uds_path));
    mesh.insert(
        "outboundTrafficPolicy".into(),
        json!({ "mode": spec.outbound_traffic_policy.mode }),
    );
    if is_enabled(spec.mixer.enabled) {
        mesh.insert(
            "mixerCheckServer".into(),
            json!(format!("istio-policy.{ns}.svc.cluster.local:9091")),
        );
        mesh.insert(
            "mixerReportServer".into(),
            json!(format!("istio-telemetry.{ns}.svc.cluster.local:9091")),
        );
    }
    if is_enabled(spec.use_mcp) && !config.remote {
        mesh.insert(
            "configSources".into(),
            json!([{ "address": format!("istio-galley.{ns}.svc:9901") }]),
        );
    }
    mesh.insert("defaultConfig".into(), Value::Object(proxy));
    Value::Object(mesh)
}

fn to_yaml(value: &Value) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))
}

impl ComponentBuilder for MeshConfigBuilder {
    fn name(&self) -> &str {
        COMPONENT
    }

    fn enabled(&self, _config: &MeshConfig) -> bool {
        !self.provided
    }

    fn build(&self, config: &MeshConfig) -> Result<DesiredObjectSet> {
        let data = BTreeMap::from([
            (MESH_KEY.to_string(), to_yaml(&mesh(config))?),
            (NETWORKS_KEY.to_string(), to_yaml(&json!({ "networks": {} }))?),
        ]);
        Ok(DesiredObjectSet::new(COMPONENT).with(ConfigMap {
            metadata: templates::object_meta(NAME, labels(&[("app", "istio")]), config),
            data: Some(data),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::super::DesiredObject;
    use super::*;
    use crate::crd::IstioSpec;

    fn mesh_document(config: &MeshConfig) -> Value {
        let set = MeshConfigBuilder::new(&[]).build(config).unwrap();
        let Some(DesiredObject::ConfigMap(cm)) = set.find("ConfigMap", NAME) else {
            panic!("mesh ConfigMap missing");
        };
        let data = cm.data.as_ref().unwrap();
        assert!(data.contains_key(NETWORKS_KEY));
        serde_yaml::from_str(&data[MESH_KEY]).unwrap()
    }

    #[test]
    fn test_mesh_points_proxies_at_pilot() {
        let mesh = mesh_document(&default_config());
        assert_eq!(
            mesh["defaultConfig"]["discoveryAddress"],
            format!("istio-pilot.{NS}:15010")
        );
        assert_eq!(mesh["rootNamespace"], NS);
        assert_eq!(mesh["outboundTrafficPolicy"]["mode"], "ALLOW_ANY");
    }

    #[test]
    fn test_mixer_servers_follow_mixer() {
        let mesh = mesh_document(&default_config());
        assert_eq!(
            mesh["mixerCheckServer"],
            format!("istio-policy.{NS}.svc.cluster.local:9091")
        );
        assert_eq!(mesh["disablePolicyChecks"], false);

        let mut spec = IstioSpec::default();
        spec.mixer.enabled = Some(false);
        let mesh = mesh_document(&config(spec));
        assert!(mesh.get("mixerCheckServer").is_none());
        assert_eq!(mesh["disablePolicyChecks"], true);
    }

    #[test]
    fn test_mcp_config_source_is_galley() {
        let mesh = mesh_document(&default_config());
        assert_eq!(
            mesh["configSources"][0]["address"],
            format!("istio-galley.{NS}.svc:9901")
        );

        let mut spec = IstioSpec::default();
        spec.use_mcp = Some(false);
        assert!(mesh_document(&config(spec)).get("configSources").is_none());
    }

    #[test]
    fn test_tracing_uses_selected_tracer() {
        let mut spec = IstioSpec::default();
        spec.tracing.enabled = Some(true);
        spec.tracing.tracer = Some(TracerType::Datadog);
        spec.tracing.datadog.address = Some("dd-agent:8126".to_string());
        let mesh = mesh_document(&config(spec));
        assert_eq!(mesh["enableTracing"], true);
        assert_eq!(
            mesh["defaultConfig"]["tracing"]["datadog"]["address"],
            "dd-agent:8126"
        );
    }

    /// Story: a rendered `istio` ConfigMap wins over the generated one
    #[test]
    fn story_rendered_mesh_config_takes_precedence() {
        let rendered = RenderedComponent::from_values(
            "base",
            vec![json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "istio" },
                "data": { "mesh": "{}" }
            })],
        );
        assert!(!MeshConfigBuilder::new(&[rendered]).enabled(&default_config()));
        assert!(MeshConfigBuilder::new(&[]).enabled(&default_config()));
    }
}
