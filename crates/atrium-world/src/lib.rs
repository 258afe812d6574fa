//! Atrium world core -- the tick-synchronized simulation shared by the
//! authoritative server and every connected client.
//!
//! The [`World`](world::World) owns all live entities (players and scripted
//! apps), the blueprint registry, the chat ring, the event bus, the scene
//! arena and the physics state. It is advanced by the
//! [`TickEngine`](tick::TickEngine) in four ordered phases per frame; only
//! entities in the hot set participate in the update phases.
//!
//! # Architecture
//!
//! - **[`entity`]**: kind-tagged entity variant, user records, id minting.
//! - **[`store`]**: the indexed entity map with player and hot sub-indexes.
//! - **[`blueprint`]**: immutable-by-version (model, script, config) catalog.
//! - **[`scene`]**: arena-indexed scene graph with weak upward references.
//! - **[`events`]**: named local event bus with per-listener isolation.
//! - **[`chat`]**: bounded chat ring.
//! - **[`interp`]**: pose interpolators for remote replicas.
//! - **[`physics`]**: rapier3d wrapper (bodies, colliders, queries, layers).
//! - **[`controller`]**: the capsule character-controller policy.
//! - **[`player`]**: local and remote player entities.
//! - **[`app`]**: scripted app entities and the async build pipeline.
//! - **[`tick`]**: the fixed/variable/late/post-late phase driver.
//! - **[`persist`]**: dirty-sets, the external store trait, JSON file store.
//! - **[`world`]**: the aggregate and the inbound-packet application layer.
//!
//! # Concurrency model
//!
//! Single-threaded cooperative: every entity mutation, script invocation
//! and event emission happens on the simulation task. Asset fetches and app
//! builds are detached local tasks whose completions drain back into the
//! world between frames, never mid-phase.

#![deny(unsafe_code)]

pub mod app;
pub mod blueprint;
pub mod chat;
pub mod controller;
pub mod entity;
pub mod events;
pub mod interp;
pub mod math;
pub mod persist;
pub mod physics;
pub mod player;
pub mod scene;
pub mod store;
pub mod tick;
pub mod world;

pub use entity::{fresh_blueprint_id, fresh_entity_id, Entity, EntityKind, Role, UserRecord};
pub use world::{World, WorldConfig};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

use atrium_protocol::{BlueprintId, EntityId};

/// Errors surfaced by the simulation core.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// A message referenced an entity that does not exist.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    /// A message referenced a blueprint that does not exist.
    #[error("unknown blueprint {0}")]
    UnknownBlueprint(BlueprintId),

    /// An operation targeted the wrong entity kind.
    #[error("entity {id} is a {actual}, expected a {expected}")]
    WrongKind {
        /// The entity in question.
        id: EntityId,
        /// Its actual kind.
        actual: &'static str,
        /// The kind the operation needed.
        expected: &'static str,
    },

    /// A wire payload failed schema validation.
    #[error(transparent)]
    Protocol(#[from] atrium_protocol::ProtocolError),

    /// The persistence backend failed; degraded to logging and retried on
    /// the next interval.
    #[error("persistence failure: {0}")]
    Persistence(String),
}
