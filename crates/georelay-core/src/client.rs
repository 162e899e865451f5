//! Client identity and role.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Identifier a client chooses for itself at registration.
///
/// Unique among currently registered clients only; an id may be reused
/// once its previous owner has disconnected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Creates a ClientId from a string without validation.
    ///
    /// Use [`ClientId::parse`] for untrusted input.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a ClientId from untrusted input, rejecting blank ids.
    ///
    /// The id is kept verbatim; only empty or whitespace-only ids fail.
    pub fn parse(id: &str) -> Result<Self, DomainError> {
        if id.trim().is_empty() {
            return Err(DomainError::EmptyClientId);
        }
        Ok(Self(id.to_string()))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Role
// ============================================================================

/// What a client is doing in the pooling scenario.
///
/// Wire names follow the mobile app: riders are `"commuter"` and
/// driver-candidates are `"taxi"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// A passenger looking at nearby vehicles.
    #[serde(rename = "commuter")]
    Rider,

    /// A client sharing a vehicle; eligible for pooling groups.
    #[serde(rename = "taxi")]
    DriverCandidate,
}

impl Role {
    /// Wire representation of the role.
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Self::Rider => "commuter",
            Self::DriverCandidate => "taxi",
        }
    }

    /// Returns true if clients with this role are grouped.
    pub fn is_groupable(&self) -> bool {
        matches!(self, Self::DriverCandidate)
    }
}

impl FromStr for Role {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commuter" => Ok(Self::Rider),
            "taxi" => Ok(Self::DriverCandidate),
            other => Err(DomainError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_parse_rejects_blank() {
        assert_eq!(ClientId::parse("rider-7").unwrap().as_str(), "rider-7");
        assert_eq!(ClientId::parse("   "), Err(DomainError::EmptyClientId));
        assert_eq!(ClientId::parse(""), Err(DomainError::EmptyClientId));
    }

    #[test]
    fn test_role_wire_names() {
        assert_eq!("taxi".parse::<Role>().unwrap(), Role::DriverCandidate);
        assert_eq!("commuter".parse::<Role>().unwrap(), Role::Rider);
        assert!(matches!(
            "driver".parse::<Role>(),
            Err(DomainError::UnknownRole(r)) if r == "driver"
        ));
        assert_eq!(Role::DriverCandidate.to_string(), "taxi");
    }

    #[test]
    fn test_role_serde_matches_wire_names() {
        let json = serde_json::to_string(&Role::Rider).unwrap();
        assert_eq!(json, "\"commuter\"");
        let role: Role = serde_json::from_str("\"taxi\"").unwrap();
        assert_eq!(role, Role::DriverCandidate);
    }

    #[test]
    fn test_only_driver_candidates_group() {
        assert!(Role::DriverCandidate.is_groupable());
        assert!(!Role::Rider.is_groupable());
    }
}
