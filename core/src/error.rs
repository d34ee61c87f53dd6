//! Error types for the core crate
//!
//! This module provides a consolidated error type for the core crate,
//! wrapping errors from the lease, access and configuration components.

use thiserror::Error;
use std::io;

/// Core error type
#[derive(Error, Debug)]
pub enum CoreError {
    /// A shared resource is exhausted (e.g. all leases for a resource are held)
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Request parameters are invalid
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    /// Resource does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Lease acquisition or release failure
    #[error("Lease error: {0}")]
    Lease(String),

    /// Operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Remote lease service error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl CoreError {
    /// Whether the error reports an exhausted shared resource
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, CoreError::LimitExceeded(_))
    }
}

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, CoreError>;

/// Convert any displayable error to a lease error
pub fn to_lease_error<E: std::fmt::Display>(err: E) -> CoreError {
    CoreError::Lease(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_detection() {
        assert!(CoreError::LimitExceeded("busy".into()).is_limit_exceeded());
        assert!(!CoreError::Lease("busy".into()).is_limit_exceeded());
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::BadParameter("expiry is in the past".into());
        assert_eq!(err.to_string(), "Bad parameter: expiry is in the past");
        assert_eq!(to_lease_error("boom").to_string(), "Lease error: boom");
    }
}
