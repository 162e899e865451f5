//! georelay protocol - wire format between mobile clients and the relay
//!
//! Clients send JSON text frames; this crate validates them once at the
//! boundary into strongly typed [`InboundMessage`] values and defines the
//! JSON the relay sends back.

pub mod message;
pub mod parse;

pub use message::{
    codes, text, CloseReason, LocationRelay, ServerMessage, TAXI_LIMIT_ERROR,
};
pub use parse::{parse_inbound, InboundMessage, LocationUpdate, ProtocolError, RawInbound, Registration};
