//! Connection registry: the set of admitted connections and the clients
//! bound to them.
//!
//! Storage is keyed by [`ConnectionId`] with a secondary index from
//! [`ClientId`], so a client id is bound to at most one connection at a
//! time. The registry is plain data owned by the registry actor; it never
//! touches the grouper, so callers removing an entry are responsible for
//! releasing the client's group membership.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use georelay_core::{ClientId, GroupId, Position, Role};
use georelay_protocol::CloseReason;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::commands::RegistryError;
use crate::liveness::ProbeState;

// ============================================================================
// Connection Plumbing
// ============================================================================

/// Server-assigned identifier for one transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(n: u64) -> Self {
        Self(n)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Frames queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// JSON text, shared between every recipient of a broadcast.
    Text(Arc<String>),
    /// WebSocket ping.
    Probe,
    /// Close frame; the writer stops after sending it.
    Close(CloseReason),
}

impl Outbound {
    pub fn text(json: String) -> Self {
        Self::Text(Arc::new(json))
    }
}

/// Result of a non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// Outbound queue full; the frame was dropped.
    Full,
    /// Writer gone or connection closing.
    Closed,
}

/// The registry's way of talking to one connection.
///
/// Sending never blocks: the actor must not wait on a slow socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    outbound: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(outbound: mpsc::Sender<Outbound>, closed: CancellationToken) -> Self {
        Self { outbound, closed }
    }

    /// Creates a handle with a fresh outbound queue of `buffer` frames.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// Queues a frame without waiting.
    pub fn try_deliver(&self, frame: Outbound) -> Delivery {
        if self.closed.is_cancelled() {
            return Delivery::Closed;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Queues a close frame and signals the connection to stop.
    ///
    /// Safe to call more than once; only the first call queues a frame.
    pub fn close(&self, reason: CloseReason) {
        if self.closed.is_cancelled() {
            return;
        }
        let _ = self.outbound.try_send(Outbound::Close(reason));
        self.closed.cancel();
    }

    /// Signals the connection to stop without a close frame.
    pub fn abort(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.outbound.is_closed()
    }

    /// Token cancelled when the registry tears the connection down.
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

// ============================================================================
// Registry Entries
// ============================================================================

/// A registered participant.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub role: Role,
    /// None until the first position is known.
    pub position: Option<Position>,
    pub group_id: Option<GroupId>,
    pub last_heartbeat_at: Instant,
    pub registered_at: DateTime<Utc>,
    pub connection: ConnectionId,
}

impl Client {
    pub fn new(
        id: ClientId,
        role: Role,
        position: Option<Position>,
        connection: ConnectionId,
        now: Instant,
    ) -> Self {
        Self {
            id,
            role,
            position,
            group_id: None,
            last_heartbeat_at: now,
            registered_at: Utc::now(),
            connection,
        }
    }

    pub fn view(&self) -> ClientView {
        ClientView {
            id: self.id.clone(),
            role: self.role,
            position: self.position,
            group_id: self.group_id.clone(),
            connection: self.connection,
            registered_at: self.registered_at,
        }
    }
}

/// Read-only snapshot of a client for queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientView {
    pub id: ClientId,
    pub role: Role,
    pub position: Option<Position>,
    pub group_id: Option<GroupId>,
    pub connection: ConnectionId,
    pub registered_at: DateTime<Utc>,
}

/// One admitted connection.
#[derive(Debug)]
pub struct ConnectionEntry {
    pub handle: ConnectionHandle,
    pub probe: ProbeState,
    /// Bound after a successful registration.
    pub client: Option<Client>,
}

/// What a [`ConnectionRegistry::for_each`] visitor wants done with a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Collect the connection for teardown after the traversal.
    Remove,
}

// ============================================================================
// Connection Registry
// ============================================================================

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    /// Primary storage.
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// ClientId → owning connection.
    by_client: HashMap<ClientId, ConnectionId>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of admitted connections, registered or not.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn client_count(&self) -> usize {
        self.by_client.len()
    }

    /// Adds an admitted connection with no client bound yet.
    pub fn open(&mut self, connection: ConnectionId, handle: ConnectionHandle, now: Instant) {
        self.connections.insert(
            connection,
            ConnectionEntry {
                handle,
                probe: ProbeState::new(now),
                client: None,
            },
        );
    }

    /// Binds a client to its connection.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateId` if the id is bound to another connection
    /// - `RegistryError::UnknownConnection` if the connection was never opened
    /// - `RegistryError::AlreadyRegistered` if the connection already has a client
    pub fn register(&mut self, client: Client) -> Result<(), RegistryError> {
        let connection = client.connection;
        if let Some(&owner) = self.by_client.get(&client.id) {
            if owner != connection {
                return Err(RegistryError::DuplicateId(client.id));
            }
        }

        let entry = self
            .connections
            .get_mut(&connection)
            .ok_or(RegistryError::UnknownConnection(connection))?;
        if let Some(existing) = &entry.client {
            return Err(RegistryError::AlreadyRegistered(existing.id.clone()));
        }

        self.by_client.insert(client.id.clone(), connection);
        entry.client = Some(client);
        Ok(())
    }

    /// Stores a new position for a registered client.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownClient` if the id is not registered
    pub fn update_position(
        &mut self,
        id: &ClientId,
        position: Position,
    ) -> Result<&mut Client, RegistryError> {
        let client = self
            .client_mut(id)
            .ok_or_else(|| RegistryError::UnknownClient(id.clone()))?;
        client.position = Some(position);
        Ok(client)
    }

    /// Records that a frame arrived on `connection`.
    pub fn acknowledge(&mut self, connection: ConnectionId, now: Instant) -> bool {
        match self.connections.get_mut(&connection) {
            Some(entry) => {
                entry.probe.acknowledge(now);
                if let Some(client) = entry.client.as_mut() {
                    client.last_heartbeat_at = now;
                }
                true
            }
            None => false,
        }
    }

    /// Removes a connection and its client binding. Idempotent.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(&connection)?;
        if let Some(client) = &entry.client {
            // Only drop the index if it still points here.
            if self.by_client.get(&client.id) == Some(&connection) {
                self.by_client.remove(&client.id);
            }
        }
        Some(entry)
    }

    pub fn connection_of(&self, id: &ClientId) -> Option<ConnectionId> {
        self.by_client.get(id).copied()
    }

    pub fn entry(&self, connection: ConnectionId) -> Option<&ConnectionEntry> {
        self.connections.get(&connection)
    }

    pub fn client(&self, id: &ClientId) -> Option<&Client> {
        let connection = self.by_client.get(id)?;
        self.connections.get(connection)?.client.as_ref()
    }

    pub fn client_mut(&mut self, id: &ClientId) -> Option<&mut Client> {
        let connection = self.by_client.get(id)?;
        self.connections.get_mut(connection)?.client.as_mut()
    }

    /// Visits every registered client.
    ///
    /// Returns the connections the visitor asked to remove; the caller
    /// tears them down once the traversal is over.
    pub fn for_each<F>(&self, mut visitor: F) -> Vec<ConnectionId>
    where
        F: FnMut(&Client, &ConnectionHandle) -> Visit,
    {
        let mut removals = Vec::new();
        for (connection, entry) in &self.connections {
            if let Some(client) = &entry.client {
                if visitor(client, &entry.handle) == Visit::Remove {
                    removals.push(*connection);
                }
            }
        }
        removals
    }

    /// All admitted connections, registered or not.
    pub fn entries_mut(&mut self) -> impl Iterator<Item = (ConnectionId, &mut ConnectionEntry)> {
        self.connections.iter_mut().map(|(id, entry)| (*id, entry))
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.connections.values().filter_map(|e| e.client.as_ref())
    }
}
