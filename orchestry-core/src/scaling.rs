//! Scaling specifications and the policy derived from them.

use serde::{Deserialize, Serialize};

use crate::ValidationError;

/// Whether the autoscaler is allowed to act on an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingMode {
    /// The autoscaler evaluates and applies scaling decisions.
    Auto,
    /// Replica counts only change through explicit scale requests.
    Manual,
}

impl ScalingMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }
}

impl std::str::FromStr for ScalingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(Self::Auto),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown scaling mode {other:?}")),
        }
    }
}

/// The `scaling` block of an app manifest.
///
/// Every field has a default so a manifest may declare only what it cares
/// about. Signals with a zero budget (e.g. `maxConnPerReplica: 0`) are
/// excluded from autoscaling evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    #[serde(default = "defaults::mode")]
    pub mode: ScalingMode,
    #[serde(default = "defaults::min_replicas")]
    pub min_replicas: u32,
    #[serde(default = "defaults::max_replicas")]
    pub max_replicas: u32,
    #[serde(rename = "targetRPSPerReplica", default = "defaults::target_rps")]
    pub target_rps_per_replica: f64,
    #[serde(default = "defaults::max_p95")]
    pub max_p95_latency_ms: f64,
    #[serde(default)]
    pub max_conn_per_replica: f64,
    #[serde(rename = "maxCPUPct", default = "defaults::max_cpu")]
    pub max_cpu_pct: f64,
    #[serde(default = "defaults::max_memory")]
    pub max_memory_pct: f64,
    #[serde(default = "defaults::scale_out")]
    pub scale_out_threshold_pct: f64,
    #[serde(default = "defaults::scale_in")]
    pub scale_in_threshold_pct: f64,
    #[serde(default = "defaults::window")]
    pub window_seconds: u64,
    #[serde(default = "defaults::cooldown")]
    pub cooldown_seconds: u64,
}

impl Default for ScalingSpec {
    fn default() -> Self {
        Self {
            mode: defaults::mode(),
            min_replicas: defaults::min_replicas(),
            max_replicas: defaults::max_replicas(),
            target_rps_per_replica: defaults::target_rps(),
            max_p95_latency_ms: defaults::max_p95(),
            max_conn_per_replica: 0.0,
            max_cpu_pct: defaults::max_cpu(),
            max_memory_pct: defaults::max_memory(),
            scale_out_threshold_pct: defaults::scale_out(),
            scale_in_threshold_pct: defaults::scale_in(),
            window_seconds: defaults::window(),
            cooldown_seconds: defaults::cooldown(),
        }
    }
}

mod defaults {
    use super::ScalingMode;

    pub(super) fn mode() -> ScalingMode {
        ScalingMode::Auto
    }
    pub(super) fn min_replicas() -> u32 {
        1
    }
    pub(super) fn max_replicas() -> u32 {
        10
    }
    pub(super) fn target_rps() -> f64 {
        50.0
    }
    pub(super) fn max_p95() -> f64 {
        250.0
    }
    pub(super) fn max_cpu() -> f64 {
        80.0
    }
    pub(super) fn max_memory() -> f64 {
        80.0
    }
    pub(super) fn scale_out() -> f64 {
        80.0
    }
    pub(super) fn scale_in() -> f64 {
        30.0
    }
    pub(super) fn window() -> u64 {
        60
    }
    pub(super) fn cooldown() -> u64 {
        180
    }
}

impl ScalingSpec {
    /// Check the policy invariants: `min ≥ 1`, `max ≥ min`,
    /// `scaleIn < scaleOut`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min_replicas < 1 {
            return Err(ValidationError::MinReplicas);
        }
        if self.max_replicas < self.min_replicas {
            return Err(ValidationError::MaxBelowMin {
                min: self.min_replicas,
                max: self.max_replicas,
            });
        }
        if self.scale_in_threshold_pct >= self.scale_out_threshold_pct {
            return Err(ValidationError::ThresholdOrder {
                scale_in: self.scale_in_threshold_pct,
                scale_out: self.scale_out_threshold_pct,
            });
        }
        Ok(())
    }

    /// Derive the runtime policy the autoscaler evaluates against.
    #[must_use]
    pub fn policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            min: self.min_replicas,
            max: self.max_replicas,
            target_rps_per_replica: self.target_rps_per_replica,
            max_p95_latency_ms: self.max_p95_latency_ms,
            max_conn_per_replica: self.max_conn_per_replica,
            max_cpu_pct: self.max_cpu_pct,
            max_memory_pct: self.max_memory_pct,
            scale_out_threshold_pct: self.scale_out_threshold_pct,
            scale_in_threshold_pct: self.scale_in_threshold_pct,
            window_seconds: self.window_seconds,
            cooldown_seconds: self.cooldown_seconds,
        }
    }
}

/// The budgets and thresholds one app is autoscaled against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPolicy {
    pub min: u32,
    pub max: u32,
    /// Requests per second one replica is expected to absorb. Zero disables
    /// the signal.
    pub target_rps_per_replica: f64,
    pub max_p95_latency_ms: f64,
    pub max_conn_per_replica: f64,
    pub max_cpu_pct: f64,
    pub max_memory_pct: f64,
    /// Utilisation (as percent of budget) above which a scale-out fires.
    pub scale_out_threshold_pct: f64,
    /// Utilisation below which evaluations count toward a scale-in.
    pub scale_in_threshold_pct: f64,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        ScalingSpec::default().policy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_are_valid() {
        ScalingSpec::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_bounds() {
        let spec = ScalingSpec {
            min_replicas: 4,
            max_replicas: 2,
            ..ScalingSpec::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::MaxBelowMin { min: 4, max: 2 })
        ));
    }

    #[test]
    fn rejects_overlapping_thresholds() {
        let spec = ScalingSpec {
            scale_in_threshold_pct: 80.0,
            scale_out_threshold_pct: 80.0,
            ..ScalingSpec::default()
        };
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::ThresholdOrder { .. })
        ));
    }

    #[test]
    fn manifest_field_names_roundtrip() {
        let json = serde_json::json!({
            "mode": "auto",
            "minReplicas": 2,
            "maxReplicas": 5,
            "targetRPSPerReplica": 50,
            "maxP95LatencyMs": 200,
            "scaleOutThresholdPct": 80,
            "scaleInThresholdPct": 30,
            "windowSeconds": 20,
            "cooldownSeconds": 30
        });
        let spec: ScalingSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.min_replicas, 2);
        assert_eq!(spec.target_rps_per_replica, 50.0);
        assert_eq!(spec.window_seconds, 20);
    }
}
