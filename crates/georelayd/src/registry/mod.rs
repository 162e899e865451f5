//! Connection registry using the Actor pattern.
//!
//! The registry is the single owner of relay state: admitted connections,
//! registered clients, and pooling groups. Connection tasks talk to it
//! through a [`RegistryHandle`]; the actor processes one command at a
//! time, so admission, grouping and teardown never interleave.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ RegistryCommand ┌─────────────────┐ RegistryEvent ┌──────────────┐
//! │ ConnectionHandler│────────────────▶│  RegistryActor  │──────────────▶│ subscribers  │
//! │  (per socket)    │  (mpsc channel) │                 │  (broadcast)  │ (GroupMirror)│
//! └──────────────────┘                 │ ConnectionReg.  │               └──────────────┘
//!          ▲                           │ ProximityGrouper│
//!          │ Outbound (bounded mpsc)   │ Dispatcher      │
//!          └───────────────────────────│ Admission       │
//!                                      └─────────────────┘
//!                                               ▲
//!                          LivenessTick         │
//!                  ┌────────────────┐           │
//!                  │ liveness ticker│───────────┘
//!                  └────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use tokio::sync::{broadcast, mpsc};

mod actor;
mod clients;
mod commands;
mod handle;

pub use actor::RegistryActor;
pub use clients::{
    Client, ClientView, ConnectionEntry, ConnectionHandle, ConnectionId, ConnectionRegistry,
    Delivery, Outbound, Visit,
};
pub use commands::{RegistryCommand, RegistryError, RegistryEvent, RegistryStats, RemovalReason};
pub use handle::RegistryHandle;

use crate::config::RelayConfig;
use crate::liveness::LivenessMonitor;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 256;

/// Spawn the registry actor and return a handle for interaction.
///
/// This function:
/// 1. Creates command and event channels
/// 2. Spawns the RegistryActor on a tokio task
/// 3. Spawns the liveness ticker
/// 4. Returns a RegistryHandle for client use
///
/// # Example
///
/// ```no_run
/// use georelayd::config::RelayConfig;
/// use georelayd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry(&RelayConfig::default());
///     let stats = handle.stats().await;
/// }
/// ```
pub fn spawn_registry(config: &RelayConfig) -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let actor = RegistryActor::new(cmd_rx, event_tx.clone(), config);
    tokio::spawn(actor.run());

    let handle = RegistryHandle::new(cmd_tx, event_tx);

    LivenessMonitor::from_config(config).spawn_ticker(handle.command_sender());

    handle
}
