//! Driver error types

use thiserror::Error;

/// Result type alias for driver operations
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Driver-specific error types
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Failure scripted for a statement
    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<DriverError> for trellis_core::Error {
    fn from(err: DriverError) -> Self {
        trellis_core::Error::Driver(err.to_string())
    }
}
