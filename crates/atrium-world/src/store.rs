//! The indexed map of live entities.
//!
//! Primary index id -> entity, plus the player sub-index, the hot set (the
//! walk-set the tick engine iterates) and a reference to the local player.
//! Hot membership toggles are O(1). Identifiers of removed entities are
//! remembered and refused if they ever come back -- ids are never reused
//! within a session.

use std::collections::{BTreeSet, HashMap, HashSet};

use atrium_protocol::EntityId;
use tracing::warn;

use crate::entity::{Entity, EntityRecord};

/// Indexed storage for all live entities.
#[derive(Default)]
pub struct EntityStore {
    entities: HashMap<EntityId, Entity>,
    players: BTreeSet<EntityId>,
    hot: BTreeSet<EntityId>,
    local_player: Option<EntityId>,
    retired: HashSet<EntityId>,
}

impl EntityStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity. `local` marks it as the locally-owned player.
    /// Returns `false` (and drops the entity) if the id is already live or
    /// was used before.
    pub fn add(&mut self, entity: Entity, local: bool) -> bool {
        let id = entity.id();
        if self.entities.contains_key(&id) || self.retired.contains(&id) {
            warn!(%id, "rejecting reused entity id");
            return false;
        }
        if matches!(entity, Entity::Player(_)) {
            self.players.insert(id);
            if local {
                self.local_player = Some(id);
            }
        }
        self.entities.insert(id, entity);
        true
    }

    /// Borrow an entity.
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    /// Borrow an entity mutably.
    pub fn get_mut(&mut self, id: &EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    /// Take an entity out temporarily, so it can be advanced with full
    /// `&mut` access to the rest of the store. Pair with
    /// [`restore`](Self::restore).
    pub fn take(&mut self, id: &EntityId) -> Option<Entity> {
        self.entities.remove(id)
    }

    /// Put back an entity previously [`take`](Self::take)n.
    pub fn restore(&mut self, entity: Entity) {
        self.entities.insert(entity.id(), entity);
    }

    /// Remove an entity for good. Its id is retired and never accepted
    /// again.
    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        let entity = self.entities.remove(id)?;
        self.players.remove(id);
        self.hot.remove(id);
        if self.local_player == Some(*id) {
            self.local_player = None;
        }
        self.retired.insert(*id);
        Some(entity)
    }

    /// Toggle hot-set membership. O(1) either way.
    pub fn set_hot(&mut self, id: EntityId, hot: bool) {
        if !self.entities.contains_key(&id) {
            return;
        }
        if hot {
            self.hot.insert(id);
        } else {
            self.hot.remove(&id);
        }
        if let Some(entity) = self.entities.get_mut(&id) {
            entity.common_mut().hot = hot;
        }
    }

    /// The hot walk-set, in id order, cloned so entities can be mutated
    /// during the walk.
    pub fn hot_ids(&self) -> Vec<EntityId> {
        self.hot.iter().copied().collect()
    }

    /// All player ids, in id order.
    pub fn player_ids(&self) -> Vec<EntityId> {
        self.players.iter().copied().collect()
    }

    /// All entity ids, in arbitrary order.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// The locally-owned player, if any.
    pub fn local_player(&self) -> Option<EntityId> {
        self.local_player
    }

    /// Number of live entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Serialize every entity to its record, players first then apps, each
    /// group in id order (deterministic snapshots).
    pub fn serialize(&self) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> =
            self.entities.values().map(Entity::to_record).collect();
        records.sort_by_key(|r| (matches!(r.kind, crate::entity::EntityKind::App), r.id));
        records
    }
}
