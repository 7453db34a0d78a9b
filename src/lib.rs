//! Mesh operator - installs and reconciles an Istio control plane
//!
//! An `Istio` resource describes one mesh. The operator resolves it into a
//! fully defaulted configuration, builds the desired objects of every enabled
//! component, converges them against the local cluster, and replays a reduced
//! pipeline against every peer registered through a `RemoteIstio`.
//!
//! # Modules
//!
//! - [`crd`] - `Istio` and `RemoteIstio` custom resources
//! - [`defaults`] - Defaulting and validation of mesh specs
//! - [`resources`] - Component builders producing desired objects
//! - [`reconcile`] - Convergence engine and cluster client seam
//! - [`remote`] - Peer cluster registry and replicated sync
//! - [`controller`] - Reconcilers for the custom resources
//! - [`runner`] - Controller runtime and health endpoints
//! - [`telemetry`] / [`metrics`] - Logging, tracing and metrics
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod defaults;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod reconcile;
pub mod remote;
pub mod resources;
pub mod runner;
pub mod telemetry;
pub mod yaml;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T, E = Error> = std::result::Result<T, E>;
