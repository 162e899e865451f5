//! Connection handler for individual WebSocket clients.
//!
//! Each accepted socket gets its own `ConnectionHandler` that:
//! - Completes the WebSocket handshake
//! - Asks the registry for admission
//! - Parses incoming frames and routes them to the registry
//! - Runs a writer task draining the connection's outbound queue
//!
//! The handler never writes to the socket directly; replies, relays,
//! probes and close frames all go through the same bounded queue, in
//! order.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::net::SocketAddr;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use georelay_core::ClientId;
use georelay_protocol::{
    codes, parse_inbound, text, CloseReason, InboundMessage, ProtocolError, ServerMessage,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::{
    ConnectionHandle, ConnectionId, Delivery, Outbound, RegistryError, RegistryHandle,
    RemovalReason,
};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, waiting for admission.
    Connecting,
    /// Counted against the ceiling, no identity yet.
    Admitted,
    /// Bound to a client id.
    Registered,
    /// Teardown requested.
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Admitted)
                | (Connecting, Closing)
                | (Admitted, Registered)
                | (Admitted, Closing)
                | (Registered, Closing)
                | (Closing, Closed)
        )
    }
}

/// Per-connection limits, extracted from [`RelayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub max_message_size: usize,
    pub outbound_buffer: usize,
    /// Write timeout for a single frame.
    pub write_timeout: Duration,
}

impl From<&RelayConfig> for ConnectionSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            outbound_buffer: config.outbound_buffer,
            write_timeout: config.write_timeout(),
        }
    }
}

/// What the read loop does after a frame.
enum Flow {
    Continue,
    /// Close from this side, then tell the registry.
    Close(RemovalReason, Option<CloseReason>),
    /// The outbound side is gone: the registry tore the connection down,
    /// or the writer failed.
    Ended,
}

// ============================================================================
// Connection Handler
// ============================================================================

pub struct ConnectionHandler {
    connection: ConnectionId,
    peer: SocketAddr,
    registry: RegistryHandle,
    settings: ConnectionSettings,
    state: ConnectionState,
    client_id: Option<ClientId>,
}

impl ConnectionHandler {
    pub fn new(
        connection: ConnectionId,
        peer: SocketAddr,
        registry: RegistryHandle,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            connection,
            peer,
            registry,
            settings,
            state: ConnectionState::Connecting,
            client_id: None,
        }
    }

    /// Runs the connection until it closes.
    ///
    /// `shutdown` is the server-wide token; the connection closes with
    /// "Server shutting down" when it fires.
    pub async fn run(
        mut self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<(), ConnectionError> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        let (sink, source) = ws.split();

        let (handle, outbound_rx) = ConnectionHandle::channel(self.settings.outbound_buffer);
        let closed = handle.closed_token();
        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            closed.clone(),
            self.connection,
            self.settings.write_timeout,
        ));

        debug!(connection = %self.connection, peer = %self.peer, "WebSocket connected");

        let result = match self.registry.admit(self.connection, handle.clone()).await {
            Ok(()) => {
                self.transition(ConnectionState::Admitted);
                self.read_loop(source, &handle, &closed, &shutdown).await;
                Ok(())
            }
            Err(RegistryError::CapacityExceeded { max }) => {
                reply(
                    &handle,
                    &ServerMessage::error_with_code(text::SERVER_AT_CAPACITY, codes::CAPACITY_EXCEEDED),
                );
                handle.close(CloseReason::server_at_capacity());
                self.transition(ConnectionState::Closing);
                Err(ConnectionError::Rejected { max })
            }
            Err(e) => {
                handle.close(CloseReason::shutting_down());
                self.transition(ConnectionState::Closing);
                Err(ConnectionError::Registry(e))
            }
        };

        // The registry's copy of the handle is gone after teardown; drop
        // ours so the writer sees the end of the queue.
        drop(handle);
        if let Err(e) = writer.await {
            warn!(connection = %self.connection, error = %e, "Writer task failed");
        }
        self.transition(ConnectionState::Closed);

        info!(
            connection = %self.connection,
            client_id = ?self.client_id,
            "Connection closed"
        );
        result
    }

    async fn read_loop(
        &mut self,
        mut source: WsSource,
        handle: &ConnectionHandle,
        closed: &CancellationToken,
        shutdown: &CancellationToken,
    ) {
        let flow = loop {
            let flow = tokio::select! {
                _ = closed.cancelled() => Flow::Ended,

                _ = shutdown.cancelled() => {
                    Flow::Close(RemovalReason::Shutdown, Some(CloseReason::shutting_down()))
                }

                frame = source.next() => match frame {
                    None => Flow::Close(RemovalReason::Disconnected, None),
                    Some(Err(e)) => {
                        debug!(connection = %self.connection, error = %e, "Read failed");
                        Flow::Close(RemovalReason::TransportFailed, None)
                    }
                    Some(Ok(message)) => self.handle_frame(message, handle).await,
                },
            };

            match flow {
                Flow::Continue => continue,
                other => break other,
            }
        };

        self.transition(ConnectionState::Closing);

        let reason = match flow {
            Flow::Close(reason, close) => {
                match close {
                    Some(close) => handle.close(close),
                    None => handle.abort(),
                }
                reason
            }
            // No-op if the registry already removed this connection.
            _ => RemovalReason::TransportFailed,
        };
        self.registry.disconnect(self.connection, reason, None).await;
    }

    async fn handle_frame(&mut self, message: Message, handle: &ConnectionHandle) -> Flow {
        match message {
            Message::Text(frame) => {
                let size = frame.len();
                if size > self.settings.max_message_size {
                    self.registry.heartbeat(self.connection).await;
                    let err = ProtocolError::MessageTooLarge {
                        size,
                        max: self.settings.max_message_size,
                    };
                    warn!(connection = %self.connection, size, "Oversized frame");
                    reply(handle, &err.to_server_message());
                    return Flow::Continue;
                }
                self.handle_text(frame.as_str(), handle).await
            }
            Message::Binary(_) => {
                self.registry.heartbeat(self.connection).await;
                reply(handle, &ServerMessage::error(text::INVALID_FORMAT));
                Flow::Continue
            }
            Message::Close(_) => Flow::Close(RemovalReason::Disconnected, None),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                self.registry.heartbeat(self.connection).await;
                Flow::Continue
            }
        }
    }

    async fn handle_text(&mut self, frame: &str, handle: &ConnectionHandle) -> Flow {
        let inbound = match parse_inbound(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.registry.heartbeat(self.connection).await;
                debug!(connection = %self.connection, error = %e, "Rejected inbound frame");
                reply(handle, &e.to_server_message());
                if e.closes_connection() {
                    return Flow::Close(
                        RemovalReason::ProtocolViolation,
                        Some(CloseReason::invalid_registration()),
                    );
                }
                return Flow::Continue;
            }
        };

        match inbound {
            InboundMessage::Register(registration) => {
                let id = registration.id.clone();
                match self.registry.register(self.connection, registration).await {
                    Ok(_) => {
                        self.client_id = Some(id);
                        self.transition(ConnectionState::Registered);
                        Flow::Continue
                    }
                    Err(RegistryError::AlreadyRegistered(_)) => {
                        reply(handle, &ServerMessage::error(text::ALREADY_REGISTERED));
                        Flow::Continue
                    }
                    Err(RegistryError::DuplicateId(_) | RegistryError::NoAvailableGroups { .. }) => {
                        Flow::Ended
                    }
                    Err(e) => self.registry_failure(e),
                }
            }
            InboundMessage::LocationUpdate(update) => {
                if self.state != ConnectionState::Registered {
                    self.registry.heartbeat(self.connection).await;
                    debug!(
                        connection = %self.connection,
                        client_id = %update.id,
                        "Location update before registration, dropping"
                    );
                    return Flow::Continue;
                }
                match self.registry.update_location(self.connection, update).await {
                    Ok(()) | Err(RegistryError::UnknownClient(_)) => Flow::Continue,
                    Err(RegistryError::NoAvailableGroups { .. }) => Flow::Ended,
                    Err(e) => self.registry_failure(e),
                }
            }
        }
    }

    fn registry_failure(&self, error: RegistryError) -> Flow {
        match error {
            RegistryError::ChannelClosed => {
                Flow::Close(RemovalReason::Shutdown, Some(CloseReason::shutting_down()))
            }
            other => {
                warn!(connection = %self.connection, error = %other, "Registry rejected frame");
                Flow::Continue
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            debug!(
                connection = %self.connection,
                from = ?self.state,
                to = ?next,
                "Unexpected state transition"
            );
        }
        self.state = next;
    }
}

/// Queues a control message for this connection.
fn reply(handle: &ConnectionHandle, message: &ServerMessage) {
    match message.to_json() {
        Ok(json) => {
            if handle.try_deliver(Outbound::text(json)) != Delivery::Delivered {
                debug!("Could not queue reply");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize reply"),
    }
}

/// Drains the outbound queue onto the socket.
///
/// Frames already queued when the connection is cancelled are still
/// written, so a reply queued before a close frame always arrives first.
async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
    connection: ConnectionId,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = closed.cancelled() => None,
        };

        let Some(frame) = frame else {
            break;
        };

        let (message, last) = match frame {
            Outbound::Text(json) => (Message::text(json.as_str().to_owned()), false),
            Outbound::Probe => (Message::Ping(Vec::new().into()), false),
            Outbound::Close(reason) => (
                Message::Close(Some(CloseFrame {
                    code: CloseCode::from(reason.code),
                    reason: reason.reason.into(),
                })),
                true,
            ),
        };

        match timeout(write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!(connection = %connection, error = %e, "Write failed");
                closed.cancel();
                break;
            }
            Err(_) => {
                warn!(connection = %connection, "Write timed out");
                closed.cancel();
                break;
            }
        }

        if last {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("Server at capacity (max: {max} connections)")]
    Rejected { max: usize },

    #[error("Registry error: {0}")]
    Registry(RegistryError),
}
