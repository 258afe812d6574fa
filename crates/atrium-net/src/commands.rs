//! Chat command dispatch.
//!
//! A chat body starting with `/` is a command: handled commands are never
//! stored as visible chat, and failures come back as private system
//! messages on the issuing socket only.

use atrium_protocol::messages::{ChatMessageWire, EntityModifiedMsg};
use atrium_protocol::{PayloadValue, SessionId};
use atrium_world::entity::Role;
use tracing::info;

use crate::replicator::ServerState;

/// Send a system line to one socket only. Not stored in the log.
pub fn private_system_message(state: &ServerState, target: SessionId, body: &str) {
    let Some(session) = state.sessions.get(target) else {
        return;
    };
    let message = ChatMessageWire {
        id: 0,
        from_entity: None,
        author: None,
        body: body.to_owned(),
        timestamp: state.world.sim_time(),
    };
    session.send(&message.to_packet());
}

/// Dispatch a `/command` body from `origin`. Returns `true` if the command
/// was recognized (and therefore must not be stored as chat).
pub fn handle_command(state: &mut ServerState, origin: SessionId, body: &str) -> bool {
    let Some((name, rest)) = atrium_world::chat::ChatLog::parse_command(body) else {
        return false;
    };
    match name {
        "name" => handle_name(state, origin, rest),
        "admin" => handle_admin(state, origin, rest),
        "spawn" => handle_spawn(state, origin, rest),
        other => {
            private_system_message(state, origin, &format!("unknown command /{other}"));
        }
    }
    true
}

fn handle_name(state: &mut ServerState, origin: SessionId, rest: &str) {
    let new_name = rest.trim();
    if new_name.is_empty() {
        private_system_message(state, origin, "usage: /name <new name>");
        return;
    }
    let Some((user_id, player_entity)) = state
        .sessions
        .get(origin)
        .map(|s| (s.user_id.clone(), s.player_entity))
    else {
        return;
    };
    let Some(record) = state.users.rename(&user_id, new_name) else {
        return;
    };
    state.world.dirty.users.insert(user_id);
    broadcast_user_update(state, origin, player_entity, &record);
    private_system_message(state, origin, &format!("you are now {new_name}"));
}

fn handle_admin(state: &mut ServerState, origin: SessionId, rest: &str) {
    let Some(expected) = state.config.admin_code.clone() else {
        private_system_message(state, origin, "admin access is not enabled");
        return;
    };
    if rest.trim() != expected {
        private_system_message(state, origin, "incorrect admin code");
        return;
    }
    let Some((user_id, player_entity)) = state
        .sessions
        .get(origin)
        .map(|s| (s.user_id.clone(), s.player_entity))
    else {
        return;
    };
    let Some(record) = state.users.grant(&user_id, Role::Admin) else {
        return;
    };
    info!(%origin, user = %record.name, "admin granted");
    state.world.dirty.users.insert(user_id);
    broadcast_user_update(state, origin, player_entity, &record);
    private_system_message(state, origin, "admin granted");
}

fn handle_spawn(state: &mut ServerState, origin: SessionId, rest: &str) {
    let Some((user_id, player_entity)) = state
        .sessions
        .get(origin)
        .map(|s| (s.user_id.clone(), s.player_entity))
    else {
        return;
    };
    let can = state
        .users
        .get(&user_id)
        .is_some_and(atrium_world::entity::UserRecord::can_build);
    if !can {
        private_system_message(state, origin, "you do not have permission to move the spawn");
        return;
    }
    match rest.trim() {
        "set" => {
            let Some(pose) = state
                .world
                .store
                .get(&player_entity)
                .and_then(atrium_world::entity::Entity::as_player)
                .map(|p| p.pose)
            else {
                return;
            };
            state.world.set_spawn(pose);
            private_system_message(state, origin, "spawn point set");
        }
        "clear" => {
            state.world.clear_spawn();
            private_system_message(state, origin, "spawn point cleared");
        }
        other => {
            private_system_message(state, origin, &format!("usage: /spawn set|clear (got {other:?})"));
        }
    }
}

/// Broadcast a user-record change on the player entity, to everyone
/// including the origin (their own display name changed too).
fn broadcast_user_update(
    state: &mut ServerState,
    _origin: SessionId,
    player_entity: atrium_protocol::EntityId,
    record: &atrium_world::entity::UserRecord,
) {
    if let Some(player) = state
        .world
        .store
        .get_mut(&player_entity)
        .and_then(atrium_world::entity::Entity::as_player_mut)
    {
        player.user = record.clone();
        player.common.bump_version();
    }
    state.world.dirty.entities.insert(player_entity);

    let mut msg = EntityModifiedMsg::for_entity(player_entity);
    let json = serde_json::to_value(record).expect("user record serializes");
    msg.user = Some(PayloadValue::from_json(&json));
    state.sessions.broadcast(&msg.to_packet(), None);
}
