//! Registry actor - owns all relay state and processes commands.
//!
//! The RegistryActor is the single owner of connections, clients and
//! groups. It receives commands via an mpsc channel, handles them one at a
//! time, and publishes events via broadcast. It never awaits network I/O:
//! everything it sends to a client goes through that connection's bounded
//! outbound queue.
//!
//! # Teardown
//!
//! Every way a connection can end (peer close, transport failure, protocol
//! violation, liveness eviction, replacement, group rejection, shutdown)
//! goes through `teardown`: registry removal, group
//! release, close frame, cancellation, event. Tearing down a connection
//! that is already gone is a no-op.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Channel send failures are logged but don't panic

use georelay_core::{ClientId, GroupId, Position};
use georelay_protocol::{
    codes, text, CloseReason, LocationRelay, LocationUpdate, Registration, ServerMessage,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::clients::{
    Client, ClientView, ConnectionHandle, ConnectionId, ConnectionRegistry, Delivery, Outbound,
};
use super::commands::{RegistryCommand, RegistryError, RegistryEvent, RegistryStats, RemovalReason};
use crate::admission::{Admission, AdmissionController, AdmissionRejection};
use crate::broadcast::BroadcastDispatcher;
use crate::config::{DuplicatePolicy, RelayConfig};
use crate::grouping::{GroupOutcome, GroupRejection, GrouperSettings, ProximityGrouper, Release};
use crate::liveness::{LivenessMonitor, Verdict};

// ============================================================================
// Registry Actor
// ============================================================================

/// The registry actor - owns all relay state.
///
/// # Ownership
///
/// The actor owns:
/// - `registry`: admitted connections and their bound clients
/// - `grouper`: live pooling groups
///
/// # Invariants
///
/// A client's `group_id` is `Some(g)` exactly when the grouper lists the
/// client as a member of `g`. Both sides are only changed together, inside
/// a single command.
pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,
    registry: ConnectionRegistry,
    grouper: ProximityGrouper,
    dispatcher: BroadcastDispatcher,
    liveness: LivenessMonitor,
    admission: AdmissionController,
    duplicate_policy: DuplicatePolicy,
    event_publisher: broadcast::Sender<RegistryEvent>,
}

impl RegistryActor {
    pub fn new(
        receiver: mpsc::Receiver<RegistryCommand>,
        event_publisher: broadcast::Sender<RegistryEvent>,
        config: &RelayConfig,
    ) -> Self {
        Self {
            receiver,
            registry: ConnectionRegistry::new(),
            grouper: ProximityGrouper::new(GrouperSettings::from(config)),
            dispatcher: BroadcastDispatcher::new(config.broadcast_radius_m),
            liveness: LivenessMonitor::from_config(config),
            admission: AdmissionController::new(config.max_clients),
            duplicate_policy: config.duplicate_policy,
            event_publisher,
        }
    }

    /// Runs the actor event loop until every command sender is dropped.
    pub async fn run(mut self) {
        info!(
            max_clients = self.admission.max_clients(),
            "Registry actor starting"
        );

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(
            connections = self.registry.len(),
            groups = self.grouper.group_count(),
            "Registry actor stopped"
        );
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Admit {
                connection,
                handle,
                respond_to,
            } => {
                let result = self.handle_admit(connection, handle);
                // Ignore send error - the connection task may be gone
                let _ = respond_to.send(result);
            }
            RegistryCommand::Register {
                connection,
                registration,
                respond_to,
            } => {
                let result = self.handle_register(connection, registration);
                let _ = respond_to.send(result);
            }
            RegistryCommand::UpdateLocation {
                connection,
                update,
                respond_to,
            } => {
                let result = self.handle_update_location(connection, update);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Heartbeat { connection } => {
                self.registry.acknowledge(connection, Instant::now());
            }
            RegistryCommand::Disconnect {
                connection,
                reason,
                close,
            } => {
                self.teardown(connection, reason, close);
            }
            RegistryCommand::LivenessTick => {
                self.handle_liveness_tick();
            }
            RegistryCommand::Notify { client_id, message } => {
                self.handle_notify(&client_id, &message);
            }
            RegistryCommand::CloseAll { reason, respond_to } => {
                let closed = self.handle_close_all(reason);
                let _ = respond_to.send(closed);
            }
            RegistryCommand::GetClient {
                client_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.registry.client(&client_id).map(Client::view));
            }
            RegistryCommand::GetAllClients { respond_to } => {
                let _ = respond_to.send(self.handle_get_all_clients());
            }
            RegistryCommand::GetGroups { respond_to } => {
                let _ = respond_to.send(self.grouper.groups());
            }
            RegistryCommand::Stats { respond_to } => {
                let _ = respond_to.send(self.stats());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_admit(
        &mut self,
        connection: ConnectionId,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        match self.admission.try_admit(self.registry.len()) {
            Admission::Accepted => {
                self.registry.open(connection, handle, Instant::now());
                debug!(
                    connection = %connection,
                    open = self.registry.len(),
                    "Connection admitted"
                );
                Ok(())
            }
            Admission::Rejected(AdmissionRejection::CapacityExceeded { max }) => {
                Err(RegistryError::CapacityExceeded { max })
            }
        }
    }

    /// Binds an identity to a connection and groups driver-candidates.
    fn handle_register(
        &mut self,
        connection: ConnectionId,
        registration: Registration,
    ) -> Result<Option<GroupId>, RegistryError> {
        let now = Instant::now();
        if !self.registry.acknowledge(connection, now) {
            return Err(RegistryError::UnknownConnection(connection));
        }

        let Registration { id, role, position } = registration;

        if let Some(owner) = self.registry.connection_of(&id) {
            if owner != connection {
                match self.duplicate_policy {
                    DuplicatePolicy::Replace => {
                        info!(
                            client_id = %id,
                            old = %owner,
                            new = %connection,
                            "Replacing connection for re-registered client"
                        );
                        self.teardown(owner, RemovalReason::Replaced, Some(CloseReason::replaced()));
                    }
                    DuplicatePolicy::Reject => {
                        warn!(client_id = %id, connection = %connection, "Duplicate client id rejected");
                        self.send_message(
                            connection,
                            &ServerMessage::error_with_code(text::DUPLICATE_ID, codes::DUPLICATE_ID),
                        );
                        self.teardown(
                            connection,
                            RemovalReason::DuplicateRejected,
                            Some(CloseReason::duplicate_id()),
                        );
                        return Err(RegistryError::DuplicateId(id));
                    }
                }
            }
        }

        self.registry
            .register(Client::new(id.clone(), role, position, connection, now))?;

        info!(
            client_id = %id,
            connection = %connection,
            role = %role,
            clients = self.registry.client_count(),
            "Client registered"
        );
        self.publish(RegistryEvent::ClientRegistered {
            client_id: id.clone(),
            role,
            connection,
        });

        match (role.is_groupable(), position) {
            (true, Some(position)) => self.place_in_group(&id, connection, position).map(Some),
            (true, None) => {
                debug!(client_id = %id, "Driver-candidate registered without position, grouping deferred");
                Ok(None)
            }
            (false, _) => Ok(None),
        }
    }

    /// Applies a position update, keeps grouping current, and relays it.
    fn handle_update_location(
        &mut self,
        connection: ConnectionId,
        update: LocationUpdate,
    ) -> Result<(), RegistryError> {
        self.registry.acknowledge(connection, Instant::now());

        // An id bound to some other connection is treated as unknown here.
        if self.registry.connection_of(&update.id) != Some(connection) {
            debug!(
                client_id = %update.id,
                connection = %connection,
                "Location update for unknown client, dropping"
            );
            return Err(RegistryError::UnknownClient(update.id));
        }

        let client = self.registry.update_position(&update.id, update.position)?;
        let role = client.role;
        let group_id = client.group_id.clone();

        if update.role != role {
            debug!(
                client_id = %update.id,
                registered = %role,
                claimed = %update.role,
                "Update role differs from registration, relaying registered role"
            );
        }

        let group_id = match (role.is_groupable(), group_id) {
            (true, Some(group_id)) => {
                self.grouper.track(&update.id, &group_id, update.position);
                Some(group_id)
            }
            (true, None) => Some(self.place_in_group(&update.id, connection, update.position)?),
            (false, _) => None,
        };

        let relay = LocationRelay::new(update.id.clone(), update.position, role)
            .with_group(group_id)
            .with_license_plate(update.license_plate);

        let report = self
            .dispatcher
            .dispatch(&update.id, update.position, &relay, &self.registry);

        for closed in report.closed {
            self.teardown(closed, RemovalReason::TransportFailed, None);
        }
        Ok(())
    }

    /// Assigns a group and tells the client the result.
    ///
    /// On rejection the client is sent a `taxi_limit` assignment and torn
    /// down.
    fn place_in_group(
        &mut self,
        client_id: &ClientId,
        connection: ConnectionId,
        position: Position,
    ) -> Result<GroupId, RegistryError> {
        let outcome = self.grouper.assign(client_id, position);

        let (group_id, created) = match outcome {
            GroupOutcome::Created(group_id) => (group_id, true),
            GroupOutcome::Joined(group_id) => (group_id, false),
            GroupOutcome::Rejected(GroupRejection::CapacityExceeded { max_groups }) => {
                self.send_message(connection, &ServerMessage::group_rejected(client_id.clone()));
                self.teardown(
                    connection,
                    RemovalReason::GroupRejected,
                    Some(CloseReason::no_available_groups()),
                );
                return Err(RegistryError::NoAvailableGroups { max: max_groups });
            }
        };

        if let Some(client) = self.registry.client_mut(client_id) {
            client.group_id = Some(group_id.clone());
        }

        self.send_message(
            connection,
            &ServerMessage::group_assigned(client_id.clone(), group_id.clone()),
        );

        if let Some(group) = self.grouper.group(&group_id) {
            let event = if created {
                RegistryEvent::GroupCreated {
                    group,
                    client_id: client_id.clone(),
                }
            } else {
                RegistryEvent::GroupJoined {
                    group,
                    client_id: client_id.clone(),
                }
            };
            self.publish(event);
        }

        Ok(group_id)
    }

    fn handle_liveness_tick(&mut self) {
        let now = Instant::now();
        let monitor = self.liveness;
        let mut evict = Vec::new();
        let mut probed = 0usize;

        for (connection, entry) in self.registry.entries_mut() {
            match monitor.assess(&entry.probe, now) {
                Verdict::Evict => evict.push(connection),
                Verdict::Probe => match entry.handle.try_deliver(Outbound::Probe) {
                    Delivery::Delivered => {
                        entry.probe.mark_probed();
                        probed += 1;
                    }
                    // A full queue still means the peer is slow, not dead.
                    Delivery::Full => entry.probe.mark_probed(),
                    Delivery::Closed => evict.push(connection),
                },
            }
        }

        debug!(probed, evicting = evict.len(), "Liveness tick");

        for connection in evict {
            warn!(
                connection = %connection,
                timeout_secs = monitor.timeout().as_secs(),
                "Evicting unresponsive connection"
            );
            self.teardown(
                connection,
                RemovalReason::LivenessTimeout,
                Some(CloseReason::heartbeat_timeout()),
            );
        }
    }

    fn handle_notify(&mut self, client_id: &ClientId, message: &ServerMessage) {
        match self.registry.connection_of(client_id) {
            Some(connection) => self.send_message(connection, message),
            None => debug!(client_id = %client_id, "Notify for unknown client, dropping"),
        }
    }

    fn handle_close_all(&mut self, reason: CloseReason) -> usize {
        let connections = self.registry.connection_ids();
        let count = connections.len();
        for connection in connections {
            self.teardown(connection, RemovalReason::Shutdown, Some(reason.clone()));
        }
        info!(closed = count, "Closed all connections");
        count
    }

    fn handle_get_all_clients(&self) -> Vec<ClientView> {
        let mut clients: Vec<ClientView> = self.registry.clients().map(Client::view).collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    fn stats(&self) -> RegistryStats {
        RegistryStats {
            connections: self.registry.len(),
            clients: self.registry.client_count(),
            groups: self.grouper.group_count(),
        }
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Removes a connection and everything hanging off it.
    fn teardown(
        &mut self,
        connection: ConnectionId,
        reason: RemovalReason,
        close: Option<CloseReason>,
    ) {
        let Some(entry) = self.registry.remove(connection) else {
            return;
        };

        if let Some(client) = &entry.client {
            if let Some(group_id) = &client.group_id {
                self.release_group(&client.id, group_id);
            }
        }

        match close {
            Some(close) => entry.handle.close(close),
            None => entry.handle.abort(),
        }

        match entry.client {
            Some(client) => {
                info!(
                    client_id = %client.id,
                    connection = %connection,
                    reason = %reason,
                    remaining = self.registry.client_count(),
                    "Client removed"
                );
                self.publish(RegistryEvent::ClientRemoved {
                    client_id: client.id,
                    connection,
                    reason,
                });
            }
            None => {
                debug!(connection = %connection, reason = %reason, "Connection closed before registering");
            }
        }
    }

    fn release_group(&mut self, client_id: &ClientId, group_id: &GroupId) {
        match self.grouper.release(client_id, group_id) {
            Release::Left { group_id, .. } => {
                if let Some(group) = self.grouper.group(&group_id) {
                    self.publish(RegistryEvent::GroupLeft {
                        group,
                        client_id: client_id.clone(),
                    });
                }
            }
            Release::Dissolved { group_id } => {
                self.publish(RegistryEvent::GroupDeleted {
                    group_id,
                    client_id: client_id.clone(),
                });
            }
            Release::NotMember => {
                warn!(client_id = %client_id, group_id = %group_id, "Client missing from its group");
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn send_message(&self, connection: ConnectionId, message: &ServerMessage) {
        let Some(entry) = self.registry.entry(connection) else {
            return;
        };
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(connection = %connection, error = %e, "Failed to serialize message");
                return;
            }
        };
        if entry.handle.try_deliver(Outbound::text(json)) != Delivery::Delivered {
            debug!(connection = %connection, "Could not queue control message");
        }
    }

    fn publish(&self, event: RegistryEvent) {
        // No subscribers is fine
        let _ = self.event_publisher.send(event);
    }

    // ========================================================================
    // Accessors (for testing)
    // ========================================================================

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub fn groups(&self) -> Vec<crate::grouping::GroupView> {
        self.grouper.groups()
    }
}
