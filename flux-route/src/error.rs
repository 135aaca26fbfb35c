//! Error types for flux-route

use thiserror::Error;

/// Result type alias for route operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while computing routes
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Malformed CIDR notation
    #[error("invalid CIDR '{0}': expected address/prefix")]
    InvalidCidr(String),
}
