use crate::types::FailureClass;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Verification mismatch: {mismatched} of {checked} records differ")]
    VerificationMismatch { mismatched: u64, checked: u64 },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Cutover error: {0}")]
    Cutover(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("No available servers: {0}")]
    NoAvailableServers(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Transient errors worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Connectivity(_) | Error::NoAvailableServers(_) | Error::Io(_)
        )
    }

    /// Failure class recorded on a migration that ends because of this error.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Error::Validation(_) | Error::Conflict(_) | Error::InvalidState(_) => {
                FailureClass::Validation
            }
            Error::Connectivity(_) | Error::NoAvailableServers(_) | Error::Io(_) => {
                FailureClass::Connectivity
            }
            Error::VerificationMismatch { .. } => FailureClass::VerificationMismatch,
            Error::Cancelled(_) => FailureClass::Cancelled,
            Error::Cutover(_) => FailureClass::Cutover,
            Error::Timeout(_) => FailureClass::Timeout,
            Error::Storage(_)
            | Error::Serialization(_)
            | Error::NotFound(_)
            | Error::Configuration(_) => FailureClass::Storage,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
