//! Outbound message types and close reasons.

use georelay_core::{ClientId, GroupId, Position, Role};
use serde::{Deserialize, Serialize};

/// Error tag sent in a rejected `groupAssignment`.
pub const TAXI_LIMIT_ERROR: &str = "taxi_limit";

/// Human-readable texts shared by error payloads and close frames.
pub mod text {
    pub const INVALID_FORMAT: &str = "Invalid message format";
    pub const UNKNOWN_MESSAGE: &str = "Unknown message type";
    pub const INVALID_REGISTRATION: &str = "Invalid registration";
    pub const INVALID_COORDINATES: &str = "Invalid coordinates";
    pub const MESSAGE_TOO_LARGE: &str = "Message too large";
    pub const SERVER_AT_CAPACITY: &str = "Server at capacity";
    pub const NO_AVAILABLE_GROUPS: &str = "No available taxi groups";
    pub const DUPLICATE_ID: &str = "Client id already registered";
    pub const ALREADY_REGISTERED: &str = "Connection already registered";
    pub const REPLACED: &str = "Replaced by a newer connection";
    pub const HEARTBEAT_TIMEOUT: &str = "Heartbeat timeout";
    pub const SHUTTING_DOWN: &str = "Server shutting down";
    pub const SERVER_ERROR: &str = "Internal server error";
}

/// Machine-readable `code` values on error payloads.
pub mod codes {
    pub const CAPACITY_EXCEEDED: &str = "capacity_exceeded";
    pub const DUPLICATE_ID: &str = "duplicate_id";
    pub const SERVER_ERROR: &str = "server_error";
}

// ============================================================================
// Server Messages
// ============================================================================

/// Control messages sent from the relay to a client.
///
/// Location relays are not part of this enum: they reuse the client's own
/// update shape (see [`LocationRelay`]) and carry no `type` tag of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Result of placing a driver-candidate into a pooling group
    GroupAssignment {
        /// Client the assignment is for
        id: ClientId,
        /// Assigned group (success only)
        #[serde(rename = "taxiGroupId", skip_serializing_if = "Option::is_none")]
        taxi_group_id: Option<GroupId>,
        /// Error tag (rejection only)
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Rejection detail (rejection only)
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl ServerMessage {
    /// Creates a successful group assignment.
    pub fn group_assigned(id: ClientId, group_id: GroupId) -> Self {
        Self::GroupAssignment {
            id,
            taxi_group_id: Some(group_id),
            error: None,
            message: None,
        }
    }

    /// Creates a rejected group assignment (no group has room).
    pub fn group_rejected(id: ClientId) -> Self {
        Self::GroupAssignment {
            id,
            taxi_group_id: None,
            error: Some(TAXI_LIMIT_ERROR.to_string()),
            message: Some(text::NO_AVAILABLE_GROUPS.to_string()),
        }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }

    /// Serializes to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Location Relay
// ============================================================================

/// A location update forwarded from one client to its neighbours.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRelay {
    pub id: ClientId,
    pub lat: f64,
    pub lng: f64,
    #[serde(rename = "type")]
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taxi_group_id: Option<GroupId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

impl LocationRelay {
    /// Creates a relay for a sender at the given position.
    pub fn new(id: ClientId, position: Position, role: Role) -> Self {
        Self {
            id,
            lat: position.lat,
            lng: position.lng,
            role,
            taxi_group_id: None,
            license_plate: None,
        }
    }

    /// Sets the sender's group.
    pub fn with_group(mut self, group_id: Option<GroupId>) -> Self {
        self.taxi_group_id = group_id;
        self
    }

    /// Sets the sender's licence plate.
    pub fn with_license_plate(mut self, plate: Option<String>) -> Self {
        self.license_plate = plate;
        self
    }

    /// Serializes to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Close Reasons
// ============================================================================

/// WebSocket close code and reason sent when the server ends a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;

    /// Endpoint going away (server shutdown, dead peer).
    pub const GOING_AWAY: u16 = 1001;

    pub fn new(code: u16, reason: &str) -> Self {
        Self {
            code,
            reason: reason.to_string(),
        }
    }

    pub fn server_at_capacity() -> Self {
        Self::new(Self::NORMAL, text::SERVER_AT_CAPACITY)
    }

    pub fn no_available_groups() -> Self {
        Self::new(Self::NORMAL, text::NO_AVAILABLE_GROUPS)
    }

    pub fn invalid_registration() -> Self {
        Self::new(Self::NORMAL, text::INVALID_REGISTRATION)
    }

    pub fn duplicate_id() -> Self {
        Self::new(Self::NORMAL, text::DUPLICATE_ID)
    }

    pub fn replaced() -> Self {
        Self::new(Self::NORMAL, text::REPLACED)
    }

    pub fn heartbeat_timeout() -> Self {
        Self::new(Self::GOING_AWAY, text::HEARTBEAT_TIMEOUT)
    }

    pub fn shutting_down() -> Self {
        Self::new(Self::GOING_AWAY, text::SHUTTING_DOWN)
    }
}
