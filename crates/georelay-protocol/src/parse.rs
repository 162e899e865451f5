//! Parsing and validation of inbound client frames.
//!
//! The mobile clients send loosely shaped JSON: registrations carry
//! `type: "register"`, while location updates reuse `type` for the sender's
//! role. [`parse_inbound`] resolves that ambiguity once and checks every
//! required field, so nothing past this module handles raw JSON.

use georelay_core::{ClientId, DomainError, GroupId, Position, Role};
use serde::Deserialize;
use thiserror::Error;

use crate::message::{text, ServerMessage};

/// `type` value that marks a registration.
const REGISTER_KIND: &str = "register";

/// Raw inbound JSON structure, before validation.
///
/// Every field is optional so that missing fields can be reported with
/// a specific error instead of a generic deserialization failure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawInbound {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub user_type: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
    #[serde(default)]
    pub taxi_group_id: Option<String>,
    #[serde(default)]
    pub license_plate: Option<String>,
}

/// A validated client registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub id: ClientId,
    pub role: Role,
    /// Initial position; absent when the client registers before a fix.
    pub position: Option<Position>,
}

/// A validated location update.
#[derive(Debug, Clone, PartialEq)]
pub struct LocationUpdate {
    pub id: ClientId,
    pub position: Position,
    /// Role the client claims in this update.
    pub role: Role,
    /// Group the client believes it belongs to.
    pub taxi_group_id: Option<GroupId>,
    pub license_plate: Option<String>,
}

/// Strongly typed inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Register(Registration),
    LocationUpdate(LocationUpdate),
}

/// Errors produced while validating an inbound frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    /// Not JSON, not an object, or a required field is missing.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Well-formed JSON with an unrecognized `type`.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// Registration without a usable identity or role.
    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    /// Coordinates out of range.
    #[error("invalid coordinates: {0}")]
    InvalidCoordinates(DomainError),

    /// Frame exceeds the configured size limit.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl ProtocolError {
    /// Returns true if the connection must be closed after replying.
    ///
    /// Only registration failures are fatal: without an identity the
    /// server has no session to keep open.
    pub fn closes_connection(&self) -> bool {
        matches!(self, Self::InvalidRegistration(_))
    }

    /// Message text sent back to the client.
    pub fn client_text(&self) -> &'static str {
        match self {
            Self::Malformed(_) => text::INVALID_FORMAT,
            Self::UnknownMessage(_) => text::UNKNOWN_MESSAGE,
            Self::InvalidRegistration(_) => text::INVALID_REGISTRATION,
            Self::InvalidCoordinates(_) => text::INVALID_COORDINATES,
            Self::MessageTooLarge { .. } => text::MESSAGE_TOO_LARGE,
        }
    }

    /// Error payload sent back to the client.
    pub fn to_server_message(&self) -> ServerMessage {
        ServerMessage::error(self.client_text())
    }
}

/// Parses and validates a single text frame.
///
/// # Errors
///
/// See [`ProtocolError`] for the failure classes.
pub fn parse_inbound(frame: &str) -> Result<InboundMessage, ProtocolError> {
    let raw: RawInbound =
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    match raw.kind.as_deref() {
        Some(REGISTER_KIND) => parse_registration(raw).map(InboundMessage::Register),
        Some(_) => parse_location_update(raw).map(InboundMessage::LocationUpdate),
        None => Err(ProtocolError::Malformed("missing type".to_string())),
    }
}

fn parse_registration(raw: RawInbound) -> Result<Registration, ProtocolError> {
    let id = raw
        .id
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidRegistration("missing id".to_string()))
        .and_then(|id| {
            ClientId::parse(id).map_err(|e| ProtocolError::InvalidRegistration(e.to_string()))
        })?;

    let role = raw
        .user_type
        .as_deref()
        .ok_or_else(|| ProtocolError::InvalidRegistration("missing userType".to_string()))?
        .parse::<Role>()
        .map_err(|e| ProtocolError::InvalidRegistration(e.to_string()))?;

    let position = match (raw.lat, raw.lng) {
        (Some(lat), Some(lng)) => Some(
            Position::new(lat, lng)
                .map_err(|e| ProtocolError::InvalidRegistration(e.to_string()))?,
        ),
        (None, None) => None,
        _ => {
            return Err(ProtocolError::InvalidRegistration(
                "lat and lng must be sent together".to_string(),
            ))
        }
    };

    Ok(Registration { id, role, position })
}

fn parse_location_update(raw: RawInbound) -> Result<LocationUpdate, ProtocolError> {
    let kind = raw.kind.unwrap_or_default();

    let id = raw
        .id
        .as_deref()
        .ok_or_else(|| ProtocolError::Malformed("missing id".to_string()))
        .and_then(|id| ClientId::parse(id).map_err(|e| ProtocolError::Malformed(e.to_string())))?;

    let role = kind
        .parse::<Role>()
        .map_err(|_| ProtocolError::UnknownMessage(kind.clone()))?;

    let (lat, lng) = match (raw.lat, raw.lng) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => return Err(ProtocolError::Malformed("missing lat/lng".to_string())),
    };
    let position = Position::new(lat, lng).map_err(ProtocolError::InvalidCoordinates)?;

    Ok(LocationUpdate {
        id,
        position,
        role,
        taxi_group_id: raw.taxi_group_id.map(GroupId::new),
        license_plate: raw.license_plate.filter(|p| !p.trim().is_empty()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_taxi_registration() {
        let msg = parse_inbound(
            r#"{"type":"register","id":"A","userType":"taxi","lat":37.7749,"lng":-122.4194}"#,
        )
        .unwrap();

        match msg {
            InboundMessage::Register(reg) => {
                assert_eq!(reg.id.as_str(), "A");
                assert_eq!(reg.role, Role::DriverCandidate);
                assert_eq!(reg.position, Some(Position::new(37.7749, -122.4194).unwrap()));
            }
            other => panic!("Expected Register, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_registration_without_position() {
        let msg = parse_inbound(r#"{"type":"register","id":"r1","userType":"commuter"}"#).unwrap();
        assert!(matches!(
            msg,
            InboundMessage::Register(Registration { position: None, role: Role::Rider, .. })
        ));
    }

    #[test]
    fn test_registration_missing_id_closes() {
        let err = parse_inbound(r#"{"type":"register","userType":"taxi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRegistration(_)));
        assert!(err.closes_connection());
        assert_eq!(err.client_text(), "Invalid registration");
    }

    #[test]
    fn test_registration_blank_id_closes() {
        let err = parse_inbound(r#"{"type":"register","id":"  ","userType":"taxi"}"#).unwrap_err();
        assert!(err.closes_connection());
    }

    #[test]
    fn test_registration_bad_user_type() {
        let err = parse_inbound(r#"{"type":"register","id":"x","userType":"pilot"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidRegistration(ref m) if m.contains("pilot")));
    }

    #[test]
    fn test_registration_half_position() {
        let err =
            parse_inbound(r#"{"type":"register","id":"x","userType":"taxi","lat":1.0}"#).unwrap_err();
        assert!(err.closes_connection());
    }

    #[test]
    fn test_parse_location_update() {
        let msg = parse_inbound(
            r#"{"id":"C","lat":37.775,"lng":-122.4195,"type":"commuter","licensePlate":"7ABC123"}"#,
        )
        .unwrap();

        match msg {
            InboundMessage::LocationUpdate(update) => {
                assert_eq!(update.id.as_str(), "C");
                assert_eq!(update.role, Role::Rider);
                assert_eq!(update.license_plate.as_deref(), Some("7ABC123"));
                assert!(update.taxi_group_id.is_none());
            }
            other => panic!("Expected LocationUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_update_with_group_hint() {
        let msg =
            parse_inbound(r#"{"id":"A","lat":1,"lng":2,"type":"taxi","taxiGroupId":"group_3"}"#)
                .unwrap();
        match msg {
            InboundMessage::LocationUpdate(update) => {
                assert_eq!(update.taxi_group_id, Some(GroupId::new("group_3")));
            }
            other => panic!("Expected LocationUpdate, got {other:?}"),
        }
    }

    #[test]
    fn test_update_missing_coordinates_is_malformed() {
        let err = parse_inbound(r#"{"id":"A","lat":1.0,"type":"taxi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn test_update_unknown_type() {
        let err = parse_inbound(r#"{"id":"A","lat":1.0,"lng":2.0,"type":"bicycle"}"#).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownMessage("bicycle".to_string()));
        assert_eq!(err.client_text(), "Unknown message type");
    }

    #[test]
    fn test_update_out_of_range() {
        let err = parse_inbound(r#"{"id":"A","lat":123.0,"lng":2.0,"type":"taxi"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidCoordinates(_)));
        assert!(!err.closes_connection());
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = parse_inbound(r#"{"id":"A","lat":1.0,"lng":2.0}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_not_json_is_malformed() {
        for frame in ["not json", "", "[1,2,3]", r#"{"id":5,"type":"taxi"}"#] {
            let err = parse_inbound(frame).unwrap_err();
            assert!(matches!(err, ProtocolError::Malformed(_)), "frame {frame:?}");
            assert_eq!(err.to_server_message(), ServerMessage::error("Invalid message format"));
        }
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::MessageTooLarge { size: 70_000, max: 65_536 };
        assert_eq!(err.to_string(), "message too large: 70000 bytes (max: 65536)");
        assert_eq!(err.client_text(), "Message too large");
    }
}
