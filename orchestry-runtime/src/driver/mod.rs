//! Capability boundaries to the container runtime and the reverse proxy.
//!
//! The rest of the crate only sees [`RuntimeDriver`] and [`ProxyDriver`];
//! the bollard-backed implementations live in [`docker`] and [`nginx`].

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::Serialize;

use crate::Error;

pub mod docker;
pub mod nginx;

pub use docker::DockerDriver;
pub use nginx::{NginxConfig, NginxDriver};

/// Name of the bridge network all replicas attach to. Created on startup if
/// missing.
pub const DEFAULT_NETWORK: &str = "orchestry";

/// A container about to be created for one replica.
#[derive(Debug, Clone)]
pub struct CreateContainer {
    /// `<app>-<index>`.
    pub name: String,
    pub image: String,
    /// Must include `app`, `replica` and `type`; app labels are merged in.
    pub labels: HashMap<String, String>,
    /// `KEY=VALUE` pairs.
    pub env: Vec<String>,
    pub network: String,
    /// Fractional cores (`"500m"` → `0.5`).
    pub cpu_limit: Option<f64>,
    /// Bytes.
    pub memory_limit: Option<u64>,
}

/// Observed container state.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    /// Address on the orchestry bridge network, when attached.
    pub ip: Option<String>,
}

/// One-shot resource usage reading for a container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub cpu_pct: f64,
    pub memory_pct: f64,
}

/// Thin boundary to the local container runtime.
#[async_trait]
pub trait RuntimeDriver: Send + Sync + 'static {
    /// Create the named bridge network if it does not exist.
    async fn ensure_network(&self, name: &str) -> Result<(), Error>;

    /// Create a container; returns its id. A name collision surfaces as
    /// [`Error::Conflict`] and is never resolved automatically.
    async fn create_container(&self, request: &CreateContainer) -> Result<String, Error>;

    async fn start_container(&self, id: &str) -> Result<(), Error>;

    /// Graceful stop, bounded by `grace`.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), Error>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error>;

    /// Inspect one container, resolving its address on `network`.
    async fn inspect_container(&self, id: &str, network: &str) -> Result<ContainerInfo, Error>;

    /// All containers (running or not) carrying `label=value`.
    async fn list_labelled(&self, label: &str, value: &str) -> Result<Vec<ContainerInfo>, Error>;

    /// Tail of the container's stdout/stderr.
    async fn container_logs(&self, id: &str, tail: u32) -> Result<Vec<String>, Error>;

    async fn container_stats(&self, id: &str) -> Result<ContainerStats, Error>;
}

/// Global counters exposed by the proxy's stub-status interface.
///
/// The interface has no per-upstream counters; the control loop distributes
/// these fairly by replica count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProxyStatus {
    pub active_connections: u64,
    pub accepts: u64,
    pub handled: u64,
    pub requests: u64,
}

/// Thin boundary to the reverse proxy daemon.
#[async_trait]
pub trait ProxyDriver: Send + Sync + 'static {
    /// Syntax-check the full proxy configuration.
    async fn validate_config(&self) -> Result<(), Error>;

    /// Trigger a graceful reload.
    async fn reload(&self) -> Result<(), Error>;

    /// Fetch the global stub-status counters.
    async fn status(&self) -> Result<ProxyStatus, Error>;
}
