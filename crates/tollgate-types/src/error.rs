use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tollgate-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("query error: {0}")]
    Query(String),

    /// A conditional write found the row changed since it was read.
    #[error("conflict: {0}")]
    Conflict(String),
}
