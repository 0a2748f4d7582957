use thiserror::Error;

/// Errors that can occur in a store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached (connection refused, timeout, I/O).
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but rejected or failed the command.
    #[error("Store command failed: {0}")]
    Command(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    /// Whether the failure is a connectivity problem rather than a command failure.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}
