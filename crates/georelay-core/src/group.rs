//! Pooling group identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix of every server-generated group id.
pub const GROUP_ID_PREFIX: &str = "group_";

/// Identifier of a pooling group, e.g. `"group_12"`.
///
/// Generated by the server from a monotonically increasing sequence, so
/// ids are never reused within one server lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    /// Wraps an existing group id (e.g. one echoed back by a client).
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds the id for the given sequence number.
    pub fn from_sequence(seq: u64) -> Self {
        Self(format!("{GROUP_ID_PREFIX}{seq}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
