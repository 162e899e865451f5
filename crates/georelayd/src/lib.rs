//! georelay daemon - real-time location relay for ride pooling
//!
//! This crate provides the relay's server-side machinery:
//! - `registry` - Registry actor owning connections, clients and groups
//! - `grouping` - Proximity grouping of driver-candidates
//! - `broadcast` - Proximity-bounded relay of location updates
//! - `liveness` - Heartbeat probing and eviction
//! - `admission` - Global connection ceiling
//! - `server` - WebSocket listener and per-connection handlers
//! - `store` - Group store port and in-memory adapter
//! - `config` - Layered configuration
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      georelayd                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  RelayServer    │────▶│     RegistryActor           │   │
//! │  │  (WebSocket)    │     │  (connection/group owner)   │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ events            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │   broadcast::Sender         │   │
//! │  │  (per client)   │     │   (GroupMirror, tests)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod admission;
pub mod broadcast;
pub mod config;
pub mod grouping;
pub mod liveness;
pub mod registry;
pub mod server;
pub mod store;
