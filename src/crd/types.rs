//! Shared types for mesh CRDs

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Read a tri-state flag, treating unset as disabled
pub fn is_enabled(flag: Option<bool>) -> bool {
    flag.unwrap_or(false)
}

/// Scheduling and sizing knobs shared by every mesh component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BaseK8sConfiguration {
    /// Replica count for fixed-size deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica_count: Option<i32>,

    /// Lower bound for autoscaled deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper bound for autoscaled deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Container resource requirements
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Node selector passed through to the pod spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Affinity passed through to the pod spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Tolerations passed through to the pod spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,
}

/// Mesh lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MeshPhase {
    /// Resource accepted, nothing applied yet
    #[default]
    Created,
    /// Components are being converged
    Reconciling,
    /// All enabled components converged
    Available,
    /// Last reconciliation failed
    Failed,
}

impl std::fmt::Display for MeshPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Reconciling => write!(f, "Reconciling"),
            Self::Available => write!(f, "Available"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Sync state of a peer cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SyncState {
    /// Registered, not yet synced
    #[default]
    Pending,
    /// Last sync converged
    Synced,
    /// Last sync failed
    Error,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Synced => write!(f, "Synced"),
            Self::Error => write!(f, "Error"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Keep the transition time of a previous condition of the same type
    /// whose status has not changed
    pub fn since(mut self, previous: &[Condition]) -> Self {
        if let Some(prior) = previous
            .iter()
            .find(|c| c.type_ == self.type_ && c.status == self.status)
        {
            self.last_transition_time = prior.last_transition_time;
        }
        self
    }
}

/// Carry transition times from `previous` over to unchanged conditions
pub fn carry_transitions(conditions: Vec<Condition>, previous: &[Condition]) -> Vec<Condition> {
    conditions.into_iter().map(|c| c.since(previous)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_state_flags() {
        assert!(!is_enabled(None));
        assert!(!is_enabled(Some(false)));
        assert!(is_enabled(Some(true)));
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(MeshPhase::Available.to_string(), "Available");
        assert_eq!(MeshPhase::default(), MeshPhase::Created);
        assert_eq!(SyncState::default(), SyncState::Pending);
        assert_eq!(SyncState::Error.to_string(), "Error");
    }

    #[test]
    fn test_condition_serializes_with_type_key() {
        let cond = Condition::new("Ready", ConditionStatus::True, "Reconciled", "ok");
        let json = serde_json::to_value(&cond).unwrap();
        assert_eq!(json["type"], "Ready");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }

    #[test]
    fn test_transition_time_only_moves_on_status_change() {
        let mut earlier = Condition::new("Ready", ConditionStatus::True, "Reconciled", "ok");
        earlier.last_transition_time = Utc::now() - chrono::Duration::hours(1);
        let previous = vec![earlier.clone()];

        let same = Condition::new("Ready", ConditionStatus::True, "Reconciled", "ok").since(&previous);
        assert_eq!(same, earlier);

        let flipped =
            Condition::new("Ready", ConditionStatus::False, "apply", "boom").since(&previous);
        assert!(flipped.last_transition_time > earlier.last_transition_time);
    }
}
