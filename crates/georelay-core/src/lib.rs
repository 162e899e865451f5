//! georelay core - shared domain types for the location relay
//!
//! This crate provides the identifiers, roles, and geo math shared
//! between the wire protocol and the relay daemon (georelayd).
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod client;
pub mod error;
pub mod geo;
pub mod group;

// Re-exports for convenience
pub use client::{ClientId, Role};
pub use error::{DomainError, DomainResult};
pub use geo::{distance_meters, GeoBounds, Position, EARTH_RADIUS_M};
pub use group::GroupId;
