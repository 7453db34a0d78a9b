//! Custom Resource Definitions for the mesh operator

mod istio;
mod remote;
mod types;

pub use istio::{
    CitadelConfiguration, CoreDnsConfiguration, GalleyConfiguration, GatewayConfiguration,
    GatewaySdsConfiguration, GatewaysConfiguration, InitCniConfiguration, InitConfiguration,
    Istio, IstioSpec, IstioStatus, LightstepConfiguration, MixerConfiguration,
    NodeAgentConfiguration, OutboundTrafficPolicyConfiguration, PdbConfiguration,
    PilotConfiguration, ProxyConfiguration, ProxyInitConfiguration, SdsConfiguration,
    SidecarInjectorConfiguration, TracerAddress, TracerType, TracingConfiguration,
};
pub use remote::{
    IstioService, IstioServicePort, RemoteCitadelConfiguration, RemoteIstio, RemoteIstioSpec,
    RemoteIstioStatus, RemoteSidecarInjectorConfiguration, KUBECONFIG_SECRET_KEY,
};
pub use types::{
    carry_transitions, is_enabled, BaseK8sConfiguration, Condition, ConditionStatus, MeshPhase,
    SyncState,
};

/// Finalizer holding `Istio` and `RemoteIstio` resources until their
/// objects are cleaned up
pub const FINALIZER: &str = "istio.banzaicloud.io/finalizer";
