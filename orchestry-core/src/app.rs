//! Typed application manifests and the persisted app record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    resource::{parse_cpu, parse_memory},
    scaling::{ScalingMode, ScalingPolicy, ScalingSpec},
    ValidationError,
};

/// Check an app name against the `[A-Za-z0-9_-]+` rule.
///
/// App names end up as container name prefixes, label values and proxy config
/// file names, so every path that touches the filesystem re-checks this.
#[must_use]
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A declarative app manifest, as submitted to `POST /apps/register`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: AppMetadata,
    pub spec: WorkloadSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,
    /// Legacy alias for `spec.health`; folded in by [`AppManifest::normalize`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthSpec>,
}

impl AppManifest {
    /// Parse a manifest out of raw JSON without normalizing or validating it.
    pub fn from_json(raw: &Value) -> Result<Self, ValidationError> {
        Ok(serde_json::from_value(raw.clone())?)
    }

    /// Fold the `healthCheck` alias into `spec.health`.
    ///
    /// `spec.health` wins when both are present.
    #[must_use]
    pub fn normalize(mut self) -> Self {
        if self.spec.health.is_none() {
            self.spec.health = self.health_check.take();
        } else {
            self.health_check = None;
        }
        self
    }

    /// Check every manifest invariant. Called once at registration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_app_name(&self.metadata.name) {
            return Err(ValidationError::InvalidName(self.metadata.name.clone()));
        }
        if self.spec.workload != "http" {
            return Err(ValidationError::UnsupportedType(self.spec.workload.clone()));
        }
        if self.spec.ports.is_empty() {
            return Err(ValidationError::NoPorts);
        }
        if let Some(resources) = &self.spec.resources {
            if let Some(cpu) = &resources.cpu {
                parse_cpu(cpu)?;
            }
            if let Some(memory) = &resources.memory {
                parse_memory(memory)?;
            }
        }
        if let Some(scaling) = &self.scaling {
            scaling.validate()?;
        }
        Ok(())
    }

    /// The app name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// The first declared container port.
    #[must_use]
    pub fn container_port(&self) -> u16 {
        self.spec.ports.first().map_or(80, |p| p.container_port)
    }

    /// Health-check settings, falling back to the defaults for undeclared
    /// fields.
    #[must_use]
    pub fn health(&self) -> HealthSpec {
        self.spec.health.clone().unwrap_or_default()
    }

    /// Scaling mode; apps without a scaling block are manual-only.
    #[must_use]
    pub fn mode(&self) -> ScalingMode {
        self.scaling.as_ref().map_or(ScalingMode::Manual, |s| s.mode)
    }

    /// Derived scaling policy, if the manifest declares one.
    #[must_use]
    pub fn policy(&self) -> Option<ScalingPolicy> {
        self.scaling.as_ref().map(ScalingSpec::policy)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// The `spec` block of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    #[serde(rename = "type")]
    pub workload: String,
    pub image: String,
    pub ports: Vec<PortSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    pub container_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Container resource limits, in Kubernetes quantity notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// HTTP liveness probing parameters for one app's replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSpec {
    pub path: String,
    /// Seconds between probes of one target.
    pub interval: u64,
    /// Per-probe timeout in seconds.
    pub timeout: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for HealthSpec {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: 5,
            timeout: 2,
            failure_threshold: 3,
            success_threshold: 1,
        }
    }
}

/// App lifecycle status as persisted in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    Stopped,
    Running,
}

impl AppStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
        }
    }
}

impl std::str::FromStr for AppStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "running" => Ok(Self::Running),
            other => Err(format!("unknown app status {other:?}")),
        }
    }
}

/// One registered application, as stored and served by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub manifest: AppManifest,
    /// The manifest exactly as submitted, before normalization.
    pub raw_spec: Value,
    pub status: AppStatus,
    pub mode: ScalingMode,
    pub desired_replicas: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Build the stored record for a freshly registered manifest.
    ///
    /// New apps start stopped with zero replicas.
    #[must_use]
    pub fn registered(manifest: AppManifest, raw_spec: Value, now: DateTime<Utc>) -> Self {
        let mode = manifest.mode();
        Self {
            name: manifest.name().to_string(),
            manifest,
            raw_spec,
            status: AppStatus::Stopped,
            mode,
            desired_replicas: 0,
            created_at: now,
            updated_at: now,
        }
    }
}
