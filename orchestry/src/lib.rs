//! Orchestry: a container-orchestration control plane for HTTP apps.
//!
//! Registers declarative app manifests, runs them as replicated Docker
//! containers, autoscales on live metrics, keeps nginx upstreams in sync
//! with healthy replicas, and coordinates controller processes through
//! leader election over PostgreSQL.
//!
//! This crate is the assembly point: environment configuration, the HTTP
//! API, and the `orchestryd` binary that wires the store, drivers and
//! background tasks together. The machinery itself lives in
//! [`orchestry_runtime`], the data model in [`orchestry_core`] and the
//! persistence in [`orchestry_store`].

pub mod api;
pub mod config;
pub mod server;

pub use config::{Config, ConfigError};
pub use server::Node;
