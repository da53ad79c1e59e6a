use thiserror::Error;

/// Manifest and policy validation failures.
///
/// These are returned verbatim to API callers and are never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// App names become container names, label values and config file names.
    #[error("invalid app name {0:?}: must match [A-Za-z0-9_-]+")]
    InvalidName(String),

    /// Only HTTP workloads can be published to the proxy.
    #[error("unsupported workload type {0:?}: only \"http\" apps are supported")]
    UnsupportedType(String),

    #[error("app must declare at least one container port")]
    NoPorts,

    #[error("scaling.minReplicas must be at least 1")]
    MinReplicas,

    #[error("scaling.maxReplicas ({max}) must not be below minReplicas ({min})")]
    MaxBelowMin { min: u32, max: u32 },

    #[error("scaleInThresholdPct ({scale_in}) must be below scaleOutThresholdPct ({scale_out})")]
    ThresholdOrder { scale_in: f64, scale_out: f64 },

    #[error("invalid resource quantity {0:?}")]
    InvalidQuantity(String),

    /// The manifest JSON did not match the schema at all.
    #[error("invalid app manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}
