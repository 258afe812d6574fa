//! Kind-tagged entities and the records they persist to.
//!
//! Dynamic dispatch over entity kinds is a closed variant -- a world only
//! ever holds players and apps -- with the small shared surface
//! (id / owner / version / hot) factored into [`EntityCommon`].

use atrium_protocol::{BlueprintId, EntityId, SessionId};
use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::player::Player;

/// Mint a fresh entity identifier. Identifiers are random 16-byte tokens;
/// they are unique process-wide and never reused after removal within a
/// session.
pub fn fresh_entity_id() -> EntityId {
    EntityId::from_bytes(rand::random())
}

/// Mint a fresh blueprint identifier.
pub fn fresh_blueprint_id() -> BlueprintId {
    BlueprintId::from_bytes(rand::random())
}

// ---------------------------------------------------------------------------
// Users & roles
// ---------------------------------------------------------------------------

/// A role grants access to privileged commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Full control, granted through `/admin <code>`.
    Admin,
    /// May author apps and move the spawn point.
    Builder,
}

/// The persisted identity behind a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    /// Stable user id (survives reconnects).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Granted roles.
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Avatar asset URL, if the user picked one.
    #[serde(default)]
    pub avatar: Option<String>,
}

impl UserRecord {
    /// Whether the user holds `role`.
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    /// Whether the user may author apps.
    pub fn can_build(&self) -> bool {
        self.has_role(Role::Admin) || self.has_role(Role::Builder)
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Which kind a live entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A player avatar.
    Player,
    /// A scripted app.
    App,
}

impl EntityKind {
    /// Lowercase name for logs and persisted records.
    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Player => "player",
            EntityKind::App => "app",
        }
    }
}

/// The fields every entity kind shares.
#[derive(Debug, Clone)]
pub struct EntityCommon {
    /// Unique identifier.
    pub id: EntityId,
    /// The socket currently authoritative for this entity's transient
    /// state. `None` for server-owned entities.
    pub owner: Option<SessionId>,
    /// Monotone version counter; bumped on every replicated modification.
    pub version: u32,
    /// Whether the per-frame update callbacks run each tick.
    pub hot: bool,
}

impl EntityCommon {
    /// Fresh common state for a new entity.
    pub fn new(id: EntityId, owner: Option<SessionId>) -> Self {
        Self {
            id,
            owner,
            version: 0,
            hot: false,
        }
    }

    /// Bump the version counter. Monotone, never wraps in practice.
    pub fn bump_version(&mut self) {
        self.version = self.version.saturating_add(1);
    }
}

/// A live entity: the closed kind-tagged variant.
#[derive(Debug)]
pub enum Entity {
    /// A player avatar (local or remote).
    Player(Player),
    /// A scripted app.
    App(App),
}

impl Entity {
    /// The shared fields.
    pub fn common(&self) -> &EntityCommon {
        match self {
            Entity::Player(p) => &p.common,
            Entity::App(a) => &a.common,
        }
    }

    /// The shared fields, mutable.
    pub fn common_mut(&mut self) -> &mut EntityCommon {
        match self {
            Entity::Player(p) => &mut p.common,
            Entity::App(a) => &mut a.common,
        }
    }

    /// This entity's id.
    pub fn id(&self) -> EntityId {
        self.common().id
    }

    /// This entity's kind.
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Player(_) => EntityKind::Player,
            Entity::App(_) => EntityKind::App,
        }
    }

    /// The app inside, if this is one.
    pub fn as_app(&self) -> Option<&App> {
        match self {
            Entity::App(a) => Some(a),
            _ => None,
        }
    }

    /// The app inside, mutable.
    pub fn as_app_mut(&mut self) -> Option<&mut App> {
        match self {
            Entity::App(a) => Some(a),
            _ => None,
        }
    }

    /// The player inside, if this is one.
    pub fn as_player(&self) -> Option<&Player> {
        match self {
            Entity::Player(p) => Some(p),
            _ => None,
        }
    }

    /// The player inside, mutable.
    pub fn as_player_mut(&mut self) -> Option<&mut Player> {
        match self {
            Entity::Player(p) => Some(p),
            _ => None,
        }
    }

    /// Serialize to the replicated/persisted record.
    pub fn to_record(&self) -> EntityRecord {
        match self {
            Entity::Player(p) => p.to_record(),
            Entity::App(a) => a.to_record(),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityRecord
// ---------------------------------------------------------------------------

/// The serialized form of an entity, used both in the join snapshot and by
/// persistence. Transient tags (`mover`, `uploader`) are deliberately not
/// part of the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity id.
    pub id: EntityId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Owning session, if the entity has one. Lets a joining client tell
    /// its own player record apart from the replicas.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<SessionId>,
    /// Blueprint, for apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blueprint: Option<BlueprintId>,
    /// Position.
    pub position: [f64; 3],
    /// Orientation (x, y, z, w).
    pub quaternion: [f64; 4],
    /// Scale, for apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<[f64; 3]>,
    /// Script-owned state, for apps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<serde_json::Value>,
    /// User record, for players.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(fresh_entity_id()), "id collision");
        }
    }

    #[test]
    fn version_is_monotone() {
        let mut common = EntityCommon::new(fresh_entity_id(), None);
        let mut last = common.version;
        for _ in 0..10 {
            common.bump_version();
            assert!(common.version > last);
            last = common.version;
        }
    }

    #[test]
    fn roles_gate_building() {
        let mut user = UserRecord {
            id: "u1".to_owned(),
            name: "ada".to_owned(),
            roles: vec![],
            avatar: None,
        };
        assert!(!user.can_build());
        user.roles.push(Role::Builder);
        assert!(user.can_build());
        assert!(!user.has_role(Role::Admin));
    }

    #[test]
    fn record_serde_roundtrip() {
        let record = EntityRecord {
            id: fresh_entity_id(),
            kind: EntityKind::App,
            owner: None,
            blueprint: Some(fresh_blueprint_id()),
            position: [1.0, 0.0, -1.0],
            quaternion: [0.0, 0.0, 0.0, 1.0],
            scale: Some([1.0, 1.0, 1.0]),
            state: Some(serde_json::json!({ "open": true })),
            user: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: EntityRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
