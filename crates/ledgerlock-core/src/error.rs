//! Error types for Ledgerlock

use crate::locking::LockError;
use thiserror::Error;

/// Result type alias using Ledgerlock's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Ledgerlock error types
#[derive(Error, Debug)]
pub enum Error {
    // Lock errors (E300-E399)
    #[error(transparent)]
    Lock(#[from] LockError),

    // Operation errors (E500-E599)
    #[error(transparent)]
    OperationFailed(anyhow::Error),

    // Config errors (E600-E699)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::Lock(e) => e.code(),
            Self::OperationFailed(_) => "E500",
            Self::ConfigError(_) => "E600",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::Lock(LockError::AcquireTimeout { resource, .. }) => Some(format!(
                "Resource '{}' is busy. Retry later or raise the lock timeout.",
                resource
            )),
            Self::Lock(LockError::NotAuthorized { .. }) => {
                Some("Release the lock with the owner id that acquired it".to_string())
            }
            Self::ConfigError(_) => Some(format!(
                "Check the file named by {}",
                crate::config::CONFIG_PATH_ENV
            )),
            _ => None,
        }
    }

    /// Whether this is a lock timeout
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::Lock(e) if e.is_timeout())
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Self::OperationFailed(error)
    }
}
