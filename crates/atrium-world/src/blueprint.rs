//! The blueprint catalog.
//!
//! A blueprint is the immutable-by-version template behind every app:
//! (model, script, config). Any modification produces version+1 of the same
//! id; script listeners gate inbound events against the version they were
//! built from, so stale events never cross a rebuild boundary.

use std::collections::BTreeMap;

use atrium_protocol::{BlueprintId, PayloadValue};
use serde::{Deserialize, Serialize};

use crate::WorldError;

/// One blueprint version: a template for building apps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Blueprint id; shared by all versions.
    pub id: BlueprintId,
    /// Version counter. Bumped on every modification.
    pub version: u32,
    /// Model or avatar asset URL.
    #[serde(default)]
    pub model: Option<String>,
    /// Script asset URL.
    #[serde(default)]
    pub script: Option<String>,
    /// Opaque map of typed asset references handed to the script.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Whether the assets should be resolved before the world reports
    /// ready.
    #[serde(default)]
    pub preload: bool,
}

impl Blueprint {
    /// A fresh version-0 blueprint.
    pub fn new(id: BlueprintId) -> Self {
        Self {
            id,
            version: 0,
            model: None,
            script: None,
            config: serde_json::Map::new(),
            preload: false,
        }
    }
}

// ---------------------------------------------------------------------------
// BlueprintRegistry
// ---------------------------------------------------------------------------

/// The catalog of blueprints, keyed by id. Ordered so snapshots serialize
/// deterministically.
#[derive(Debug, Default)]
pub struct BlueprintRegistry {
    entries: BTreeMap<BlueprintId, Blueprint>,
}

impl BlueprintRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new blueprint. Replaces nothing: adding an id twice is a
    /// caller bug surfaced loudly in debug builds, tolerated (last wins)
    /// in release.
    pub fn add(&mut self, blueprint: Blueprint) {
        debug_assert!(
            !self.entries.contains_key(&blueprint.id),
            "blueprint {} added twice",
            blueprint.id
        );
        self.entries.insert(blueprint.id, blueprint);
    }

    /// Look up a blueprint.
    pub fn get(&self, id: &BlueprintId) -> Option<&Blueprint> {
        self.entries.get(id)
    }

    /// Apply a modification: the closure edits a copy, and the registry
    /// stores it with version+1. Returns the new version.
    ///
    /// # Errors
    ///
    /// [`WorldError::UnknownBlueprint`] if `id` is not registered.
    pub fn modify(
        &mut self,
        id: &BlueprintId,
        edit: impl FnOnce(&mut Blueprint),
    ) -> Result<u32, WorldError> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or(WorldError::UnknownBlueprint(*id))?;
        let mut next = entry.clone();
        edit(&mut next);
        // The edit may not rewind identity or version.
        next.id = entry.id;
        next.version = entry.version + 1;
        let version = next.version;
        *entry = next;
        Ok(version)
    }

    /// Install a blueprint received from a peer, keeping whichever version
    /// is newer. Used when applying `blueprintAdded`/`blueprintModified`
    /// broadcasts and snapshots.
    pub fn upsert(&mut self, blueprint: Blueprint) {
        match self.entries.get_mut(&blueprint.id) {
            Some(existing) if existing.version >= blueprint.version => {}
            Some(existing) => *existing = blueprint,
            None => {
                self.entries.insert(blueprint.id, blueprint);
            }
        }
    }

    /// Remove a blueprint (upload rollback path).
    pub fn remove(&mut self, id: &BlueprintId) -> Option<Blueprint> {
        self.entries.remove(id)
    }

    /// Number of registered blueprints.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Blueprint> {
        self.entries.values()
    }

    /// Serialize the whole catalog for the join snapshot.
    pub fn to_value(&self) -> PayloadValue {
        let records = self.entries.values().cloned().collect::<Vec<_>>();
        let json = serde_json::to_value(records).expect("blueprints serialize");
        PayloadValue::from_json(&json)
    }

    /// Rebuild from a snapshot payload.
    ///
    /// # Errors
    ///
    /// [`WorldError::Protocol`] if the payload is not a blueprint list.
    pub fn load_value(&mut self, value: &PayloadValue) -> Result<(), WorldError> {
        let json = value.to_json()?;
        let records: Vec<Blueprint> =
            serde_json::from_value(json).map_err(|e| {
                WorldError::Protocol(atrium_protocol::ProtocolError::SchemaMismatch {
                    message: "snapshot.blueprints",
                    detail: e.to_string(),
                })
            })?;
        for blueprint in records {
            self.upsert(blueprint);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::fresh_blueprint_id;

    #[test]
    fn modify_bumps_version_and_keeps_id() {
        let id = fresh_blueprint_id();
        let mut reg = BlueprintRegistry::new();
        reg.add(Blueprint::new(id));

        let v1 = reg
            .modify(&id, |bp| bp.model = Some("asset://m.glb".to_owned()))
            .unwrap();
        assert_eq!(v1, 1);
        let bp = reg.get(&id).unwrap();
        assert_eq!(bp.version, 1);
        assert_eq!(bp.id, id);
        assert_eq!(bp.model.as_deref(), Some("asset://m.glb"));

        let v2 = reg.modify(&id, |bp| bp.preload = true).unwrap();
        assert_eq!(v2, 2);
    }

    #[test]
    fn modify_unknown_blueprint_errors() {
        let mut reg = BlueprintRegistry::new();
        let err = reg.modify(&fresh_blueprint_id(), |_| {}).unwrap_err();
        assert!(matches!(err, WorldError::UnknownBlueprint(_)));
    }

    #[test]
    fn upsert_keeps_newer_version() {
        let id = fresh_blueprint_id();
        let mut reg = BlueprintRegistry::new();

        let mut v2 = Blueprint::new(id);
        v2.version = 2;
        v2.model = Some("asset://new.glb".to_owned());
        reg.upsert(v2.clone());

        // A stale broadcast must not rewind the catalog.
        let mut v1 = Blueprint::new(id);
        v1.version = 1;
        reg.upsert(v1);
        assert_eq!(reg.get(&id).unwrap(), &v2);
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut reg = BlueprintRegistry::new();
        let id = fresh_blueprint_id();
        let mut bp = Blueprint::new(id);
        bp.script = Some("asset://s.wat".to_owned());
        bp.config
            .insert("sound".to_owned(), serde_json::json!("asset://s.glb"));
        reg.add(bp.clone());

        let mut restored = BlueprintRegistry::new();
        restored.load_value(&reg.to_value()).unwrap();
        assert_eq!(restored.get(&id).unwrap(), &bp);
    }
}
