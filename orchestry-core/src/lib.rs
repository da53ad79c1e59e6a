//! Core data model for the orchestry control plane.
//!
//! This crate holds the typed representation of everything the control plane
//! persists or passes between components: application manifests and their
//! validation, scaling policies, metric samples, replica records, and the
//! cluster-coordination rows (nodes and the leader lease).
//!
//! It performs no IO. Manifest JSON is parsed and validated here, at the
//! boundary; the rest of the workspace only ever sees these types.

pub mod app;
pub mod cluster;
pub mod event;
pub mod metrics;
pub mod replica;
pub mod resource;
pub mod scaling;

mod error;

pub use app::{
    is_valid_app_name, App, AppManifest, AppMetadata, AppStatus, EnvVar, HealthSpec, PortSpec,
    ResourceSpec, WorkloadSpec,
};
pub use cluster::{ClusterNode, LeaderLease, NodeState};
pub use error::ValidationError;
pub use event::{Event, ScalingAction};
pub use metrics::MetricSample;
pub use replica::{Replica, ReplicaState};
pub use scaling::{ScalingMode, ScalingPolicy, ScalingSpec};
