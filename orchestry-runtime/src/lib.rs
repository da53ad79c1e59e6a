//! Control machinery for the orchestry control plane.
//!
//! This crate hosts the four coupled subsystems at the heart of the
//! controller, plus the thin driver boundaries they sit on:
//!
//! - [`coordinator`]: term-based leader election over the shared store
//! - [`manager`]: replica-set ownership, reconciliation and lifecycle
//! - [`autoscaler`]: windowed multi-signal scaling decisions
//! - [`control`]: the leader's periodic tick joining metrics to actions
//! - [`prober`]: per-replica HTTP liveness with hysteresis
//! - [`publisher`]: health-aware, rollback-safe proxy upstream publishing
//! - [`driver`]: the runtime (Docker) and proxy (nginx) capability
//!   boundaries
//!
//! Persistence is consumed through the capability traits of
//! `orchestry-store`, so everything here can be exercised against in-memory
//! stores in tests.

pub mod autoscaler;
pub mod control;
pub mod coordinator;
pub mod driver;
pub mod manager;
pub mod prober;
pub mod publisher;

mod error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use autoscaler::{Autoscaler, Decision, MetricsSummary, MIN_STABLE_PERIODS};
pub use control::{ControlLoop, CONTROL_INTERVAL};
pub use coordinator::{
    CoordinatorConfig, Hooks, LeaderCoordinator, LeadershipState,
};
pub use driver::{
    DockerDriver, NginxConfig, NginxDriver, ProxyDriver, ProxyStatus, RuntimeDriver,
    DEFAULT_NETWORK,
};
pub use error::{BoxError, Error};
pub use manager::{AppManager, AppStatusReport, AppUsage, StartReport, MONITOR_INTERVAL};
pub use prober::{HealthProber, ProbeSummary};
pub use publisher::UpstreamPublisher;
