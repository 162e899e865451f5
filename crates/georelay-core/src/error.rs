//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// Latitude outside [-90, 90] or not a finite number
    #[error("Invalid latitude: {0} (expected -90..=90)")]
    InvalidLatitude(f64),

    /// Longitude outside [-180, 180] or not a finite number
    #[error("Invalid longitude: {0} (expected -180..=180)")]
    InvalidLongitude(f64),

    /// Unrecognized role string on the wire
    #[error("Unknown role: {0} (expected \"taxi\" or \"commuter\")")]
    UnknownRole(String),

    /// Empty client identifier
    #[error("Client id must not be empty")]
    EmptyClientId,
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
