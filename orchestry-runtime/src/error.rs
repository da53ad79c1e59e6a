use orchestry_core::ValidationError;
use thiserror::Error;

/// Boxed error type used where the underlying failure comes from outside the
/// workspace (the container runtime, the filesystem).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the control machinery.
///
/// The first four kinds are returned to callers verbatim and never retried.
/// `Runtime` failures inside the reconciler mark the affected replica for
/// recreation on the next tick; `Proxy` failures roll the per-app config
/// back; `Store` failures abort the owning tick.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("app {0} not found")]
    NotFound(String),

    /// A container with the requested name already exists. The conflicting
    /// container is never removed automatically.
    #[error("container name conflict: {0}")]
    Conflict(String),

    #[error("container runtime error: {0}")]
    Runtime(#[source] BoxError),

    #[error("proxy error: {0}")]
    Proxy(String),

    #[error(transparent)]
    Store(#[from] orchestry_store::Error),

    /// A write was attempted on a non-leader. Carries the current leader's
    /// id when known so callers can redirect.
    #[error("this node is not the leader")]
    Leadership { leader: Option<String> },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Wrap an external failure as a runtime error.
    pub fn runtime(err: impl Into<BoxError>) -> Self {
        Self::Runtime(err.into())
    }
}
