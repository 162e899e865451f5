//! Registry actor commands, errors, and events.
//!
//! This module defines the message types for communicating with the `RegistryActor`:
//! - `RegistryCommand`: Commands sent to the actor
//! - `RegistryError`: Errors that can occur during registry operations
//! - `RegistryEvent`: Events published by the registry for subscribers

use georelay_core::{ClientId, GroupId, Role};
use georelay_protocol::{CloseReason, LocationUpdate, Registration, ServerMessage};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use super::clients::{ClientView, ConnectionHandle, ConnectionId};
use crate::grouping::GroupView;

// ============================================================================
// Registry Commands
// ============================================================================

/// Commands sent to the registry actor.
///
/// Each request/response command carries a oneshot channel for its
/// result. Fire-and-forget commands (ticks, heartbeats, notifications)
/// carry none.
#[derive(Debug)]
pub enum RegistryCommand {
    /// Admit a freshly accepted connection.
    ///
    /// # Errors
    /// - `RegistryError::CapacityExceeded` if the connection ceiling is reached
    Admit {
        connection: ConnectionId,
        handle: ConnectionHandle,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Bind a client identity to an admitted connection.
    ///
    /// Replies with the assigned group for driver-candidates that could be
    /// placed immediately.
    ///
    /// # Errors
    /// - `RegistryError::DuplicateId` under the reject policy
    /// - `RegistryError::NoAvailableGroups` if grouping was refused
    /// - `RegistryError::AlreadyRegistered` on a second registration
    Register {
        connection: ConnectionId,
        registration: Registration,
        respond_to: oneshot::Sender<Result<Option<GroupId>, RegistryError>>,
    },

    /// Apply a location update and relay it to nearby clients.
    ///
    /// # Errors
    /// - `RegistryError::UnknownClient` if the id is not registered on
    ///   this connection
    /// - `RegistryError::NoAvailableGroups` if deferred grouping was refused
    UpdateLocation {
        connection: ConnectionId,
        update: LocationUpdate,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Some frame arrived on the connection.
    Heartbeat { connection: ConnectionId },

    /// Tear a connection down.
    Disconnect {
        connection: ConnectionId,
        reason: RemovalReason,
        /// Close frame to queue first, if any.
        close: Option<CloseReason>,
    },

    /// Periodic liveness assessment.
    LivenessTick,

    /// Send a control message to a registered client.
    Notify {
        client_id: ClientId,
        message: ServerMessage,
    },

    /// Close every connection (shutdown). Replies with how many were closed.
    CloseAll {
        reason: CloseReason,
        respond_to: oneshot::Sender<usize>,
    },

    GetClient {
        client_id: ClientId,
        respond_to: oneshot::Sender<Option<ClientView>>,
    },

    GetAllClients {
        respond_to: oneshot::Sender<Vec<ClientView>>,
    },

    GetGroups {
        respond_to: oneshot::Sender<Vec<GroupView>>,
    },

    Stats {
        respond_to: oneshot::Sender<RegistryStats>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

/// Errors that can occur during registry operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    /// The connection ceiling has been reached.
    #[error("server at capacity (max: {max} connections)")]
    CapacityExceeded { max: usize },

    /// No group could take a driver-candidate.
    #[error("no available groups (max: {max} groups)")]
    NoAvailableGroups { max: usize },

    #[error("client id already registered: {0}")]
    DuplicateId(ClientId),

    #[error("connection already registered as {0}")]
    AlreadyRegistered(ClientId),

    #[error("unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

// ============================================================================
// Registry Events
// ============================================================================

/// Events published by the registry to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    ClientRegistered {
        client_id: ClientId,
        role: Role,
        connection: ConnectionId,
    },
    ClientRemoved {
        client_id: ClientId,
        connection: ConnectionId,
        reason: RemovalReason,
    },
    GroupCreated {
        group: GroupView,
        client_id: ClientId,
    },
    GroupJoined {
        group: GroupView,
        client_id: ClientId,
    },
    GroupLeft {
        group: GroupView,
        client_id: ClientId,
    },
    GroupDeleted {
        group_id: GroupId,
        client_id: ClientId,
    },
}

/// Why a connection was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// The peer closed the connection.
    Disconnected,
    /// A newer connection registered the same id.
    Replaced,
    /// Refused under the reject duplicate policy.
    DuplicateRejected,
    /// No acknowledgment within the heartbeat timeout.
    LivenessTimeout,
    /// Read or write on the socket failed.
    TransportFailed,
    /// The peer sent something the server will not tolerate.
    ProtocolViolation,
    /// No pooling group could take the driver-candidate.
    GroupRejected,
    Shutdown,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "client disconnected"),
            Self::Replaced => write!(f, "replaced by a newer connection"),
            Self::DuplicateRejected => write!(f, "duplicate id rejected"),
            Self::LivenessTimeout => write!(f, "heartbeat timeout"),
            Self::TransportFailed => write!(f, "transport failure"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::GroupRejected => write!(f, "no available groups"),
            Self::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub connections: usize,
    pub clients: usize,
    pub groups: usize,
}
