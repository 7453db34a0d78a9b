//! Metrics for mesh reconciliation
//!
//! Instruments are created lazily on the global meter, so they are no-ops
//! until telemetry installs an OTLP meter provider.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: Lazy<Meter> = Lazy::new(|| global::meter("mesh-operator"));

/// Histogram of mesh reconciliation duration
///
/// Labels:
/// - `mesh`: namespace/name of the Istio resource
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("mesh_reconcile_duration_seconds")
        .with_description("Duration of mesh reconciliation in seconds")
        .with_unit("s")
        .build()
});

/// Counter of mesh reconciliation errors
///
/// Labels:
/// - `mesh`: namespace/name of the Istio resource
/// - `error_type`: config, decode, apply, remote, kube, ...
pub static RECONCILE_ERRORS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mesh_reconcile_errors_total")
        .with_description("Total number of mesh reconciliation errors")
        .with_unit("{errors}")
        .build()
});

/// Counter of objects converged by the reconcile engine
///
/// Labels:
/// - `operation`: created, updated, unchanged
pub static OBJECTS_APPLIED: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mesh_objects_applied_total")
        .with_description("Total number of desired objects processed by operation")
        .with_unit("{objects}")
        .build()
});

/// Counter of peer cluster sync attempts
///
/// Labels:
/// - `cluster`: peer cluster name
/// - `result`: synced, error
pub static REMOTE_SYNCS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("mesh_remote_sync_total")
        .with_description("Total number of remote cluster sync attempts")
        .with_unit("{syncs}")
        .build()
});

/// Outcome of one engine operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOperation {
    /// Object did not exist and was created
    Created,
    /// Object existed but drifted and was updated
    Updated,
    /// Object already matched
    Unchanged,
}

impl ApplyOperation {
    /// Label value for this operation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }
}

/// Record a mesh reconciliation with timing
pub struct ReconcileTimer {
    mesh: String,
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a reconciliation
    pub fn start(mesh: impl Into<String>) -> Self {
        Self {
            mesh: mesh.into(),
            start: std::time::Instant::now(),
        }
    }

    /// Record successful completion
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("mesh", self.mesh),
                KeyValue::new("result", "success"),
            ],
        );
    }

    /// Record error completion
    pub fn error(self, error_type: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        RECONCILE_DURATION.record(
            duration,
            &[
                KeyValue::new("mesh", self.mesh.clone()),
                KeyValue::new("result", "error"),
            ],
        );
        RECONCILE_ERRORS.add(
            1,
            &[
                KeyValue::new("mesh", self.mesh),
                KeyValue::new("error_type", error_type.to_string()),
            ],
        );
    }
}

/// Record one processed object
pub fn record_apply(operation: ApplyOperation) {
    OBJECTS_APPLIED.add(1, &[KeyValue::new("operation", operation.as_str())]);
}

/// Record the outcome of a peer sync
pub fn record_remote_sync(cluster: &str, ok: bool) {
    REMOTE_SYNCS.add(
        1,
        &[
            KeyValue::new("cluster", cluster.to_string()),
            KeyValue::new("result", if ok { "synced" } else { "error" }),
        ],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_operation_as_str() {
        assert_eq!(ApplyOperation::Created.as_str(), "created");
        assert_eq!(ApplyOperation::Updated.as_str(), "updated");
        assert_eq!(ApplyOperation::Unchanged.as_str(), "unchanged");
    }

    #[test]
    fn test_reconcile_timer() {
        let timer = ReconcileTimer::start("istio-system/mesh");
        assert_eq!(timer.mesh, "istio-system/mesh");
        timer.success();

        ReconcileTimer::start("istio-system/mesh").error("apply");
    }

    #[test]
    fn test_recorders_without_provider() {
        record_apply(ApplyOperation::Created);
        record_remote_sync("east", true);
        record_remote_sync("west", false);
    }
}
