//! Snapshot-on-join and the inbound dispatch table.
//!
//! Every inbound packet on a socket goes through [`dispatch`]: decode,
//! optional role check, local mutation, then re-broadcast to every other
//! socket (the originator is skipped -- it already applied the change
//! locally). `entityEvent` additionally invokes the target entity's event
//! gate.
//!
//! Interest policy: every connected socket receives every entity event.
//! Spatial filtering by player position is a future-work slot.

use atrium_protocol::messages::{
    ChatMessageWire, EntityEventMsg, EntityModifiedMsg, SnapshotMsg,
};
use atrium_protocol::{EntityId, Packet, PacketKind, PayloadValue, SessionId};
use atrium_world::blueprint::Blueprint;
use atrium_world::chat::ChatLog;
use atrium_world::entity::{Entity, EntityKind, EntityRecord, UserRecord};
use atrium_world::math::Pose;
use atrium_world::World;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::commands;
use crate::config::Config;
use crate::session::{Session, SessionRegistry, UserDirectory};

/// Everything the simulation task owns.
pub struct ServerState {
    /// The authoritative world.
    pub world: World,
    /// Connected sockets.
    pub sessions: SessionRegistry,
    /// Known users and tokens.
    pub users: UserDirectory,
    /// Knob table.
    pub config: Config,
}

/// What dispatch decided about the socket.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Keep the socket.
    Continue,
    /// Close it (strike-out).
    Close,
}

// ---------------------------------------------------------------------------
// Connect
// ---------------------------------------------------------------------------

/// Admit a socket: authenticate, mint the player entity, send the full
/// snapshot, and announce the newcomer to everyone else.
pub fn handle_connect(
    state: &mut ServerState,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    name: &str,
    token: Option<&str>,
) -> SessionId {
    let id = state.sessions.allocate_id();
    let (user, fresh_token) = state.users.authenticate(token, name);

    let player_entity = state.world.spawn_remote_player(
        atrium_world::fresh_entity_id(),
        id,
        user.clone(),
        state
            .world
            .spawn
            .map(|s| Pose::from_wire(s.position, s.quaternion))
            .unwrap_or_default(),
    );
    state.world.dirty.users.insert(user.id.clone());

    let now = state.world.sim_time();
    let session = Session::new(id, user.id.clone(), player_entity, outbound, now);

    // Full world state for the joiner.
    let snapshot = SnapshotMsg {
        session_id: id,
        server_time: now,
        chat: state.world.chat.messages().to_vec(),
        blueprints: state.world.blueprints.to_value(),
        entities: state.world.entities_value(),
        auth_token: fresh_token,
    };
    session.send(&snapshot.to_packet());
    state.sessions.insert(session);

    // Everyone else learns about the new player.
    let record = state
        .world
        .store
        .get(&player_entity)
        .map(Entity::to_record)
        .expect("player just spawned");
    let json = serde_json::to_value(record).expect("entity record serializes");
    let packet = Packet::new(PacketKind::EntityAdded, PayloadValue::from_json(&json));
    state.sessions.broadcast(&packet, Some(id));

    info!(session = %id, user = %user.name, %player_entity, "session admitted");
    id
}

/// A socket went away (reader task ended or strike-out). Cleans the world
/// and announces the departure.
pub fn handle_disconnect(state: &mut ServerState, id: SessionId) {
    state.sessions.remove(id);
    state.world.handle_disconnect(id);
    info!(session = %id, "session closed");
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Process one inbound frame from `origin`.
pub fn dispatch(state: &mut ServerState, origin: SessionId, bytes: &[u8]) -> DispatchOutcome {
    let packet = match Packet::decode(bytes) {
        Ok(packet) => packet,
        Err(err) => {
            warn!(session = %origin, error = %err, "malformed packet");
            let now = state.world.sim_time();
            let close = state
                .sessions
                .get_mut(origin)
                .is_some_and(|s| s.note_malformed(now));
            return if close {
                DispatchOutcome::Close
            } else {
                DispatchOutcome::Continue
            };
        }
    };

    let result = match packet.kind {
        PacketKind::Ping => {
            if let Some(session) = state.sessions.get(origin) {
                session.send(&Packet::new(PacketKind::Pong, PayloadValue::Null));
            }
            Ok(())
        }
        PacketKind::Pong => {
            let now = state.world.sim_time();
            if let Some(session) = state.sessions.get_mut(origin) {
                session.note_pong(now);
            }
            Ok(())
        }
        PacketKind::ChatAdded => handle_chat(state, origin, &packet),
        PacketKind::EntityModified => handle_entity_modified(state, origin, &packet),
        PacketKind::EntityAdded => handle_entity_added(state, origin, &packet),
        PacketKind::EntityRemoved => handle_entity_removed(state, origin, &packet),
        PacketKind::EntityEvent => handle_entity_event(state, origin, &packet),
        PacketKind::BlueprintAdded | PacketKind::BlueprintModified => {
            handle_blueprint(state, origin, &packet)
        }
        PacketKind::Snapshot | PacketKind::PlayerTeleport => {
            // Server-to-client messages; a client has no business sending
            // them. Ignored rather than struck: the bytes were well-formed.
            debug!(session = %origin, kind = packet.kind.name(), "ignoring server-only packet");
            Ok(())
        }
    };

    if let Err(err) = result {
        warn!(session = %origin, error = %err, "inbound packet rejected");
    }
    DispatchOutcome::Continue
}

fn handle_chat(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    let message = ChatMessageWire::from_value(&packet.payload)?;

    if ChatLog::is_command(&message.body) {
        commands::handle_command(state, origin, &message.body);
        return Ok(());
    }

    let from_entity = state.sessions.get(origin).map(|s| s.player_entity);
    let author = state
        .sessions
        .get(origin)
        .and_then(|s| state.users.get(&s.user_id))
        .map(|u| u.name.clone());
    let stored = state
        .world
        .add_chat(from_entity, author, message.body, false);
    state.sessions.broadcast(&stored.to_packet(), Some(origin));
    Ok(())
}

fn handle_entity_modified(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    let msg = EntityModifiedMsg::from_payload(&packet.payload)?;
    state.world.apply_entity_modified(&msg, Some(origin))?;
    state.sessions.broadcast(packet, Some(origin));
    Ok(())
}

fn handle_entity_added(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    let json = packet.payload.to_json()?;
    let record: EntityRecord = serde_json::from_value(json).map_err(|e| {
        crate::NetError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
            message: "entityAdded",
            detail: e.to_string(),
        })
    })?;

    match record.kind {
        EntityKind::Player => {
            // Only the server mints players.
            warn!(session = %origin, "client tried to add a player entity");
            Ok(())
        }
        EntityKind::App => {
            if !can_build(state, origin) {
                commands::private_system_message(
                    state,
                    origin,
                    "you do not have permission to create apps",
                );
                return Ok(());
            }
            let Some(blueprint) = record.blueprint else {
                return Ok(());
            };
            let pose = Pose::from_wire(record.position, record.quaternion);
            let id = state
                .world
                .spawn_app(record.id, blueprint, record.owner, pose);
            if let Some(app) = state.world.store.get_mut(&id).and_then(Entity::as_app_mut) {
                if let Some(scale) = record.scale {
                    app.scale = nalgebra_scale(scale);
                }
                if let Some(dropper) = record.owner {
                    // The authoring client starts as both uploader and
                    // mover of a freshly dropped app.
                    app.uploader = Some(dropper);
                    app.mover = Some(dropper);
                }
            }
            state.sessions.broadcast(packet, Some(origin));
            Ok(())
        }
    }
}

fn handle_entity_removed(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    let id = EntityId::from_value(&packet.payload)?;
    if !can_build(state, origin) {
        commands::private_system_message(
            state,
            origin,
            "you do not have permission to remove apps",
        );
        return Ok(());
    }
    let removed_kind = state.world.store.get(&id).map(Entity::kind);
    if removed_kind == Some(EntityKind::App) {
        state.world.remove_entity(&id);
        state.world.dirty.entities.insert(id);
        state.sessions.broadcast(packet, Some(origin));
    }
    Ok(())
}

fn handle_entity_event(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    let msg = EntityEventMsg::from_payload(&packet.payload)?;
    state.world.apply_entity_event(&msg, Some(origin))?;
    state.sessions.broadcast(packet, Some(origin));
    Ok(())
}

fn handle_blueprint(
    state: &mut ServerState,
    origin: SessionId,
    packet: &Packet,
) -> Result<(), crate::NetError> {
    if !can_build(state, origin) {
        commands::private_system_message(
            state,
            origin,
            "you do not have permission to edit blueprints",
        );
        return Ok(());
    }
    let json = packet.payload.to_json()?;
    let blueprint: Blueprint = serde_json::from_value(json).map_err(|e| {
        crate::NetError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
            message: "blueprint",
            detail: e.to_string(),
        })
    })?;
    state.world.apply_blueprint(blueprint);
    state.sessions.broadcast(packet, Some(origin));
    Ok(())
}

// ---------------------------------------------------------------------------
// Upload admission
// ---------------------------------------------------------------------------

/// Enforce the upload size cap. Called by the external HTTP collaborator
/// before it accepts a file. On rejection the authoring socket gets a
/// system chat notice; no blueprint is registered and no entity is added
/// (the client rolls its local blueprint back).
pub fn admit_upload(state: &ServerState, origin: SessionId, declared_bytes: u64) -> bool {
    if declared_bytes <= state.config.max_upload_bytes() {
        return true;
    }
    warn!(
        session = %origin,
        declared_bytes,
        cap = state.config.max_upload_bytes(),
        "upload rejected: over size cap"
    );
    commands::private_system_message(
        state,
        origin,
        &format!(
            "upload rejected: {} MB exceeds the {} MB limit",
            declared_bytes / (1024 * 1024),
            state.config.max_upload_mb
        ),
    );
    false
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn can_build(state: &ServerState, origin: SessionId) -> bool {
    state
        .sessions
        .get(origin)
        .and_then(|s| state.users.get(&s.user_id))
        .is_some_and(UserRecord::can_build)
}

fn nalgebra_scale(scale: [f64; 3]) -> nalgebra::Vector3<f64> {
    nalgebra::Vector3::new(scale[0], scale[1], scale[2])
}
