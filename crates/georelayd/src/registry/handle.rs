//! Client interface for interacting with the RegistryActor.
//!
//! The `RegistryHandle` provides a cheap-to-clone interface for sending commands
//! to the registry actor and subscribing to registry events.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `RegistryError::ChannelClosed`

use georelay_core::{ClientId, GroupId};
use georelay_protocol::{CloseReason, LocationUpdate, Registration, ServerMessage};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use super::clients::{ClientView, ConnectionHandle, ConnectionId};
use super::commands::{RegistryCommand, RegistryError, RegistryEvent, RegistryStats, RemovalReason};
use crate::grouping::GroupView;

// ============================================================================
// Registry Handle
// ============================================================================

/// Handle for interacting with the registry actor.
///
/// # Usage
///
/// ```ignore
/// let handle = registry_handle.clone();
///
/// handle.admit(connection, conn_handle).await?;
/// let group = handle.register(connection, registration).await?;
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
    event_sender: broadcast::Sender<RegistryEvent>,
}

impl RegistryHandle {
    pub fn new(
        sender: mpsc::Sender<RegistryCommand>,
        event_sender: broadcast::Sender<RegistryEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a request and waits for the actor's reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Sends a command without waiting for it to be processed.
    async fn tell(&self, cmd: RegistryCommand) {
        if self.sender.send(cmd).await.is_err() {
            debug!("Registry channel closed, command dropped");
        }
    }

    /// Admits a connection, subject to the connection ceiling.
    ///
    /// # Errors
    ///
    /// - `RegistryError::CapacityExceeded` if the ceiling is reached
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn admit(
        &self,
        connection: ConnectionId,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Admit {
            connection,
            handle,
            respond_to,
        })
        .await?
    }

    /// Registers a client on an admitted connection.
    ///
    /// Returns the assigned group for a driver-candidate placed right away.
    ///
    /// # Errors
    ///
    /// - `RegistryError::DuplicateId` under the reject duplicate policy
    /// - `RegistryError::NoAvailableGroups` if no group could take the client
    /// - `RegistryError::AlreadyRegistered` if the connection already has a client
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn register(
        &self,
        connection: ConnectionId,
        registration: Registration,
    ) -> Result<Option<GroupId>, RegistryError> {
        self.request(|respond_to| RegistryCommand::Register {
            connection,
            registration,
            respond_to,
        })
        .await?
    }

    /// Applies a location update and relays it to nearby clients.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownClient` if the id is not registered on this connection
    /// - `RegistryError::NoAvailableGroups` if deferred grouping was refused
    /// - `RegistryError::ChannelClosed` if the actor has shut down
    pub async fn update_location(
        &self,
        connection: ConnectionId,
        update: LocationUpdate,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::UpdateLocation {
            connection,
            update,
            respond_to,
        })
        .await?
    }

    /// Records that a frame arrived on the connection.
    pub async fn heartbeat(&self, connection: ConnectionId) {
        self.tell(RegistryCommand::Heartbeat { connection }).await;
    }

    /// Tears a connection down, optionally sending a close frame first.
    pub async fn disconnect(
        &self,
        connection: ConnectionId,
        reason: RemovalReason,
        close: Option<CloseReason>,
    ) {
        self.tell(RegistryCommand::Disconnect {
            connection,
            reason,
            close,
        })
        .await;
    }

    /// Sends a control message to a registered client.
    pub async fn notify(&self, client_id: ClientId, message: ServerMessage) {
        self.tell(RegistryCommand::Notify { client_id, message }).await;
    }

    /// Closes every connection; returns how many were closed.
    pub async fn close_all(&self, reason: CloseReason) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::CloseAll { reason, respond_to })
            .await
    }

    pub async fn get_client(&self, client_id: ClientId) -> Result<Option<ClientView>, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetClient {
            client_id,
            respond_to,
        })
        .await
    }

    /// All registered clients, ordered by id.
    pub async fn get_all_clients(&self) -> Result<Vec<ClientView>, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetAllClients { respond_to })
            .await
    }

    /// All live groups in creation order.
    pub async fn get_groups(&self) -> Result<Vec<GroupView>, RegistryError> {
        self.request(|respond_to| RegistryCommand::GetGroups { respond_to })
            .await
    }

    pub async fn stats(&self) -> Result<RegistryStats, RegistryError> {
        self.request(|respond_to| RegistryCommand::Stats { respond_to })
            .await
    }

    /// Subscribes to registry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Returns false once the actor has stopped.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Raw command sender, for background tasks that feed the actor.
    pub(crate) fn command_sender(&self) -> mpsc::Sender<RegistryCommand> {
        self.sender.clone()
    }
}
