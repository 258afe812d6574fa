//! Atrium networking -- the authoritative server and the tick-synchronized
//! client runtime.
//!
//! The server owns identity, admission and persistence; most gameplay
//! state replicates through the snapshot + delta protocol and is applied
//! by the same [`atrium_world::World`] on every participant.
//!
//! # Architecture
//!
//! - **[`config`]**: the knob table (tick rate, network rate, save
//!   interval, ping rate, admin code, upload cap, world id) with env
//!   overrides.
//! - **[`session`]**: per-socket state, the session registry, the user
//!   directory and auth tokens.
//! - **[`commands`]**: chat command dispatch (`/name`, `/admin`,
//!   `/spawn`).
//! - **[`replicator`]**: snapshot-on-join and the inbound packet dispatch
//!   table (role checks, local mutation, skip-origin rebroadcast).
//! - **[`server`]**: the WebSocket accept loop and the single-threaded
//!   simulation task.
//! - **[`client`]**: the headless client runtime (connect, apply
//!   snapshot, stream the local pose).
//!
//! Socket I/O runs on detached local tasks; everything else happens on the
//! simulation task. Inbound packets drain into the world between frames.

#![deny(unsafe_code)]

pub mod client;
pub mod commands;
pub mod config;
pub mod replicator;
pub mod server;
pub mod session;

pub use config::Config;
pub use server::{Server, StatusReport};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by the networking layer.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Could not bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The configured listen address.
        addr: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// WebSocket handshake failed.
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// Transport-level send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer sent malformed bytes.
    #[error(transparent)]
    Protocol(#[from] atrium_protocol::ProtocolError),

    /// The world rejected a mutation.
    #[error(transparent)]
    World(#[from] atrium_world::WorldError),

    /// The server closed the connection (auth failure, strike-out).
    #[error("connection closed: {0}")]
    Closed(String),
}
