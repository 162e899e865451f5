//! WebSocket server for the relay daemon.
//!
//! The server:
//! - Listens on a TCP socket for WebSocket clients
//! - Spawns a ConnectionHandler for each client
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │                 │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │ (per socket)    │     │                 │
//! └───────┬─────────┘     └────────┬────────┘
//!         │                        │ Outbound
//!         ▼                        ▼
//! ┌─────────────────────────────────────────┐
//! │        writer task (per socket)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ConnectionError, ConnectionHandler, ConnectionSettings, ConnectionState};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use georelay_protocol::CloseReason;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::registry::{ConnectionId, RegistryHandle};

/// WebSocket server for the relay.
pub struct RelayServer {
    bind_addr: String,
    settings: ConnectionSettings,
    registry: RegistryHandle,
    cancel_token: CancellationToken,
    /// Source of connection ids; starts at 1.
    connection_counter: AtomicU64,
}

impl RelayServer {
    pub fn new(config: &RelayConfig, registry: RegistryHandle, cancel_token: CancellationToken) -> Self {
        Self {
            bind_addr: config.bind_addr(),
            settings: ConnectionSettings::from(config),
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(1),
        }
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.bind_addr.clone(),
                error: e.to_string(),
            })
    }

    /// Binds and serves until the cancellation token is triggered.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener.
    ///
    /// On cancellation the listener stops accepting and every open
    /// connection is closed with "Server shutting down".
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::Io(e.to_string()))?;
        info!(addr = %local_addr, "Relay server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.handle_connection(stream, peer),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    fn handle_connection(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let connection = ConnectionId::new(self.connection_counter.fetch_add(1, Ordering::Relaxed));
        if let Err(e) = stream.set_nodelay(true) {
            debug!(connection = %connection, error = %e, "Failed to set TCP_NODELAY");
        }

        let handler = ConnectionHandler::new(connection, peer, self.registry.clone(), self.settings);
        let shutdown = self.cancel_token.clone();

        tokio::spawn(async move {
            match handler.run(stream, shutdown).await {
                Ok(()) => {}
                Err(ConnectionError::Rejected { max }) => {
                    debug!(connection = %connection, max, "Connection rejected at capacity");
                }
                Err(e) => {
                    warn!(connection = %connection, error = %e, "Connection ended with error");
                }
            }
        });
    }

    async fn shutdown(&self) {
        match self.registry.close_all(CloseReason::shutting_down()).await {
            Ok(closed) => info!(closed, "Server cleanup complete"),
            Err(e) => warn!(error = %e, "Registry unavailable during shutdown"),
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {error}")]
    Bind { addr: String, error: String },

    #[error("I/O error: {0}")]
    Io(String),
}
