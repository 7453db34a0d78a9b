//! Error types for the mesh operator
//!
//! Every variant carries the context an operator needs to locate the fault:
//! the mesh component, the object that failed to apply, or the peer cluster
//! that could not be reached.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for mesh operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Resolved configuration violates a documented constraint
    #[error("configuration error [{component}]: {message}")]
    Config {
        /// Component whose configuration is invalid
        component: String,
        /// Description of what's invalid
        message: String,
    },

    /// A rendered manifest could not be decoded into a supported resource kind
    #[error("decode error [{component}]: {message}")]
    Decode {
        /// Component whose manifests failed to decode
        component: String,
        /// Description of what failed
        message: String,
        /// Resource kind of the offending document, if it had one
        kind: Option<String>,
    },

    /// The cluster rejected or failed to receive one desired object
    #[error("failed to apply {kind} {namespace}/{name}: {message}")]
    Apply {
        /// Kind of the failing object
        kind: String,
        /// Name of the failing object
        name: String,
        /// Namespace of the failing object (empty for cluster-scoped kinds)
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// A peer cluster is unreachable or rejected the call
    #[error("remote cluster {cluster} unreachable: {message}")]
    RemoteConnectivity {
        /// Name of the peer cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a configuration error for a component
    pub fn config(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            component: component.into(),
            message: msg.into(),
        }
    }

    /// Create a decode error without kind context
    pub fn decode(component: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            component: component.into(),
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a decode error for a document of a known kind
    pub fn decode_kind(
        component: impl Into<String>,
        kind: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Decode {
            component: component.into(),
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an apply error naming the failing object
    pub fn apply(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a connectivity error for a peer cluster
    pub fn remote(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RemoteConnectivity {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration and serialization errors need a spec change before a
    /// retry can succeed. Everything else is retried on the next event.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Config { .. } => false,
            Error::Decode { .. } => true,
            Error::Apply { .. } => true,
            Error::RemoteConnectivity { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the peer cluster name if this error is tied to one
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::RemoteConnectivity { cluster, .. } => Some(cluster),
            _ => None,
        }
    }

    /// Short machine-readable category, used as a metric label
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Kube { .. } => "kube",
            Error::Config { .. } => "config",
            Error::Decode { .. } => "decode",
            Error::Apply { .. } => "apply",
            Error::RemoteConnectivity { .. } => "remote",
            Error::Serialization { .. } => "serialization",
            Error::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a bad mesh spec is surfaced to the user, never retried blindly
    #[test]
    fn story_config_errors_wait_for_spec_change() {
        let err = Error::config("pilot", "minReplicas 4 exceeds maxReplicas 2");
        assert!(err.to_string().contains("configuration error [pilot]"));
        assert!(err.to_string().contains("exceeds maxReplicas"));
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "config");
    }

    /// Story: apply failures name the exact object that failed
    #[test]
    fn story_apply_error_identifies_failing_object() {
        let err = Error::apply(
            "Deployment",
            "istio-citadel",
            "istio-system",
            "admission webhook denied the request",
        );
        let msg = err.to_string();
        assert!(msg.contains("Deployment"));
        assert!(msg.contains("istio-system/istio-citadel"));
        assert!(msg.contains("admission webhook denied"));
        assert!(err.is_retryable());
    }

    /// Story: rendered manifests of an unknown kind fail the component pass
    #[test]
    fn story_decode_errors_carry_kind() {
        let err = Error::decode_kind("istio-cni", "CronJob", "unsupported kind");
        match &err {
            Error::Decode { kind, component, .. } => {
                assert_eq!(kind.as_deref(), Some("CronJob"));
                assert_eq!(component, "istio-cni");
            }
            _ => panic!("Expected Decode variant"),
        }
        assert!(err.is_retryable());
    }

    /// Story: an unreachable peer is attributed to that peer only
    #[test]
    fn story_remote_errors_name_the_peer() {
        let err = Error::remote("east-1", "connection refused");
        assert_eq!(err.cluster(), Some("east-1"));
        assert!(err.to_string().contains("east-1"));
        assert!(err.is_retryable());

        assert_eq!(Error::internal("boom").cluster(), None);
    }

    #[test]
    fn story_serialization_errors_are_permanent() {
        let err = Error::serialization_for_kind("Service", "invalid port");
        assert!(!err.is_retryable());

        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn test_internal_error_context() {
        let err = Error::internal_with_context("controller", "context missing");
        assert!(err.to_string().contains("internal error [controller]"));
        assert!(Error::internal("x").to_string().contains(UNKNOWN_CONTEXT));
    }
}
