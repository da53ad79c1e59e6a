use thiserror::Error;

/// Possible errors when talking to the store.
///
/// Connection and query failures surface to callers unchanged; retrying is
/// the caller's decision (in practice, the owning loop's next tick).
#[derive(Debug, Error)]
pub enum Error {
    /// The database rejected or dropped the operation.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row no longer matches the schema we expect.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The named entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Store configuration was unusable (bad env, bad pool bounds).
    #[error("invalid store configuration: {0}")]
    Config(String),
}
