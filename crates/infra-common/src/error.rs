use thiserror::Error;

/// A type alias for store operation results
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures from the persistence collaborator.
///
/// The distinction matters for degradation policy: `Unavailable` is
/// transient (drop the write, warn, keep the call running) while
/// `Schema` is permanent and fails startup.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// The store is unreachable or a write failed transiently
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store schema does not match what the core requires
    #[error("Store schema error: {0}")]
    Schema(String),

    /// A record the operation requires does not exist
    #[error("Not found: {0}")]
    NotFound(String),
}
