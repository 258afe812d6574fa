//! Persistence: dirty-sets, the external store trait, and a JSON file
//! store used by tests and the default server binary.
//!
//! The world marks entities, blueprints and users dirty as they change;
//! every save interval the session layer serializes the current state and
//! commits it through the [`WorldStore`]. Store failures degrade to a
//! logged error and are retried on the next interval -- nothing in the
//! core aborts the process over persistence.

use std::collections::HashSet;
use std::path::PathBuf;

use atrium_protocol::messages::ChatMessageWire;
use atrium_protocol::{BlueprintId, EntityId};
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;
use crate::entity::{EntityRecord, UserRecord};
use crate::WorldError;

// ---------------------------------------------------------------------------
// Dirty tracking
// ---------------------------------------------------------------------------

/// What changed since the last flush.
#[derive(Debug, Default)]
pub struct DirtySets {
    /// Entities whose records changed.
    pub entities: HashSet<EntityId>,
    /// Blueprints that gained versions.
    pub blueprints: HashSet<BlueprintId>,
    /// Users whose records changed.
    pub users: HashSet<String>,
}

impl DirtySets {
    /// Empty sets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.blueprints.is_empty() && self.users.is_empty()
    }

    /// Drain everything, leaving the sets empty.
    pub fn take(&mut self) -> DirtySets {
        std::mem::take(self)
    }
}

// ---------------------------------------------------------------------------
// Persisted shapes
// ---------------------------------------------------------------------------

/// The persisted spawn point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpawnPoint {
    /// Spawn position.
    pub position: [f64; 3],
    /// Spawn orientation (x, y, z, w).
    pub quaternion: [f64; 4],
}

impl Default for SpawnPoint {
    fn default() -> Self {
        Self {
            position: [0.0, 0.0, 0.0],
            quaternion: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

/// Everything a world commits to its store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedWorld {
    /// World identifier.
    pub world: String,
    /// Known users.
    pub users: Vec<UserRecord>,
    /// The blueprint catalog.
    pub blueprints: Vec<Blueprint>,
    /// App entities (player entities are not persisted; they rejoin).
    pub entities: Vec<EntityRecord>,
    /// Spawn point, if set.
    #[serde(default)]
    pub spawn: Option<SpawnPoint>,
    /// Chat ring snapshot.
    #[serde(default)]
    pub chat: Vec<ChatMessageWire>,
}

// ---------------------------------------------------------------------------
// WorldStore
// ---------------------------------------------------------------------------

/// The external persistence backend.
pub trait WorldStore {
    /// Commit a full world snapshot.
    ///
    /// # Errors
    ///
    /// [`WorldError::Persistence`] on backend failure; the caller logs and
    /// retries on the next interval.
    fn save(&mut self, world: &PersistedWorld) -> Result<(), WorldError>;

    /// Load the last committed snapshot, if one exists.
    ///
    /// # Errors
    ///
    /// [`WorldError::Persistence`] on backend failure.
    fn load(&mut self) -> Result<Option<PersistedWorld>, WorldError>;
}

/// In-memory store for tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// The last committed snapshot.
    pub saved: Option<PersistedWorld>,
    /// Number of commits.
    pub save_count: usize,
}

impl WorldStore for MemoryStore {
    fn save(&mut self, world: &PersistedWorld) -> Result<(), WorldError> {
        self.saved = Some(world.clone());
        self.save_count += 1;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<PersistedWorld>, WorldError> {
        Ok(self.saved.clone())
    }
}

/// JSON file store: one pretty-printed document, written via a temp file
/// and renamed into place so a crash mid-write cannot corrupt the last
/// good snapshot.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl WorldStore for JsonFileStore {
    fn save(&mut self, world: &PersistedWorld) -> Result<(), WorldError> {
        let json = serde_json::to_vec_pretty(world)
            .map_err(|e| WorldError::Persistence(format!("serialize: {e}")))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)
            .map_err(|e| WorldError::Persistence(format!("write {}: {e}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            WorldError::Persistence(format!("rename into {}: {e}", self.path.display()))
        })?;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<PersistedWorld>, WorldError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(WorldError::Persistence(format!(
                    "read {}: {err}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| WorldError::Persistence(format!("parse {}: {e}", self.path.display())))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
