//! Arena-indexed scene graph.
//!
//! Nodes live in a slot arena with generational handles; parent links point
//! upward by handle (weak -- no ownership cycles). `attach` reparents by
//! recomposing the node's world transform into the new parent's space, so
//! reparenting never visibly moves anything.

use nalgebra::Isometry3;

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Generational handle to a scene node. Stale handles (freed and recycled
/// slots) are detected and treated as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}v{}", self.index, self.generation)
    }
}

// ---------------------------------------------------------------------------
// SceneNode
// ---------------------------------------------------------------------------

/// One node: a local transform under an optional parent.
#[derive(Debug, Clone)]
pub struct SceneNode {
    /// Weak upward reference.
    pub parent: Option<NodeId>,
    /// Child handles, in insertion order.
    pub children: Vec<NodeId>,
    /// Transform relative to the parent (or world, for roots).
    pub local: Isometry3<f64>,
    /// Whether this node (and with it, its subtree) is active.
    pub active: bool,
    /// Debug label ("app-root", "avatar-base", ...).
    pub label: String,
}

struct Slot {
    generation: u32,
    node: Option<SceneNode>,
}

// ---------------------------------------------------------------------------
// SceneGraph
// ---------------------------------------------------------------------------

/// The arena of scene nodes.
#[derive(Default)]
pub struct SceneGraph {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl SceneGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a root node.
    pub fn add_root(&mut self, label: &str, local: Isometry3<f64>) -> NodeId {
        self.insert(SceneNode {
            parent: None,
            children: Vec::new(),
            local,
            active: false,
            label: label.to_owned(),
        })
    }

    /// Insert a child under `parent`. Stale parents yield a root instead;
    /// the caller's handle discipline is checked in debug builds.
    pub fn add_child(&mut self, parent: NodeId, label: &str, local: Isometry3<f64>) -> NodeId {
        debug_assert!(self.contains(parent), "add_child under stale {parent}");
        let child = self.insert(SceneNode {
            parent: self.contains(parent).then_some(parent),
            children: Vec::new(),
            local,
            active: false,
            label: label.to_owned(),
        });
        if let Some(node) = self.get_mut(parent) {
            node.children.push(child);
        }
        child
    }

    /// Whether `id` refers to a live node.
    pub fn contains(&self, id: NodeId) -> bool {
        self.slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.node.is_some())
    }

    /// Borrow a node.
    pub fn get(&self, id: NodeId) -> Option<&SceneNode> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    /// Borrow a node mutably.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    /// The node's world transform: the composition of locals up the chain.
    pub fn world_transform(&self, id: NodeId) -> Option<Isometry3<f64>> {
        let mut chain = self.get(id)?.local;
        let mut cursor = self.get(id)?.parent;
        while let Some(parent) = cursor {
            let node = self.get(parent)?;
            chain = node.local * chain;
            cursor = node.parent;
        }
        Some(chain)
    }

    /// Whether the node and all its ancestors are active.
    pub fn effectively_active(&self, id: NodeId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            match self.get(current) {
                Some(node) if node.active => cursor = node.parent,
                _ => return false,
            }
        }
        true
    }

    /// Activate or deactivate a subtree root.
    pub fn set_active(&mut self, id: NodeId, active: bool) {
        if let Some(node) = self.get_mut(id) {
            node.active = active;
        }
    }

    /// Reparent `id` under `new_parent`, recomposing the world transform
    /// into the new parent's local space so the node does not move.
    pub fn attach(&mut self, id: NodeId, new_parent: NodeId) {
        let Some(world) = self.world_transform(id) else {
            return;
        };
        let Some(parent_world) = self.world_transform(new_parent) else {
            return;
        };

        self.unlink_from_parent(id);

        if let Some(node) = self.get_mut(id) {
            node.parent = Some(new_parent);
            node.local = parent_world.inverse() * world;
        }
        if let Some(parent) = self.get_mut(new_parent) {
            parent.children.push(id);
        }
    }

    /// Remove a node and its whole subtree. Returns the removed handles
    /// (depth-first), so callers can release paired resources.
    pub fn remove_subtree(&mut self, id: NodeId) -> Vec<NodeId> {
        if !self.contains(id) {
            return Vec::new();
        }
        self.unlink_from_parent(id);

        let mut removed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.take(current) {
                stack.extend(node.children);
                removed.push(current);
            }
        }
        removed
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    // -- internals ----------------------------------------------------------

    fn insert(&mut self, node: SceneNode) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            NodeId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeId {
                index,
                generation: 0,
            }
        }
    }

    fn take(&mut self, id: NodeId) -> Option<SceneNode> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(node)
    }

    fn unlink_from_parent(&mut self, id: NodeId) {
        let parent = self.get(id).and_then(|n| n.parent);
        if let Some(parent) = parent {
            if let Some(node) = self.get_mut(parent) {
                node.children.retain(|&c| c != id);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use nalgebra::{Translation3, UnitQuaternion, Vector3};

    use super::*;

    fn at(x: f64, y: f64, z: f64) -> Isometry3<f64> {
        Isometry3::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity())
    }

    #[test]
    fn world_transform_composes_up_the_chain() {
        let mut scene = SceneGraph::new();
        let root = scene.add_root("root", at(1.0, 0.0, 0.0));
        let child = scene.add_child(root, "child", at(0.0, 2.0, 0.0));

        let world = scene.world_transform(child).unwrap();
        assert_eq!(world.translation.vector, Vector3::new(1.0, 2.0, 0.0));
    }

    #[test]
    fn attach_preserves_world_position() {
        let mut scene = SceneGraph::new();
        let a = scene.add_root("a", at(5.0, 0.0, 0.0));
        let b = scene.add_root("b", at(-3.0, 1.0, 0.0));
        let child = scene.add_child(a, "child", at(0.0, 0.0, 2.0));

        let before = scene.world_transform(child).unwrap();
        scene.attach(child, b);
        let after = scene.world_transform(child).unwrap();

        let drift = (before.translation.vector - after.translation.vector).norm();
        assert!(drift < 1e-9, "attach moved the node by {drift}");
        assert_eq!(scene.get(child).unwrap().parent, Some(b));
        assert!(scene.get(b).unwrap().children.contains(&child));
        assert!(!scene.get(a).unwrap().children.contains(&child));
    }

    #[test]
    fn remove_subtree_frees_everything_and_invalidates_handles() {
        let mut scene = SceneGraph::new();
        let root = scene.add_root("root", at(0.0, 0.0, 0.0));
        let child = scene.add_child(root, "child", at(0.0, 0.0, 0.0));
        let grandchild = scene.add_child(child, "grandchild", at(0.0, 0.0, 0.0));
        assert_eq!(scene.len(), 3);

        let removed = scene.remove_subtree(root);
        assert_eq!(removed.len(), 3);
        assert!(scene.is_empty());
        for id in [root, child, grandchild] {
            assert!(!scene.contains(id), "{id} should be gone");
        }

        // Recycled slots must not resurrect old handles.
        let fresh = scene.add_root("fresh", at(0.0, 0.0, 0.0));
        assert!(!scene.contains(root));
        assert!(scene.contains(fresh));
    }

    #[test]
    fn effective_activity_requires_the_whole_chain() {
        let mut scene = SceneGraph::new();
        let root = scene.add_root("root", at(0.0, 0.0, 0.0));
        let child = scene.add_child(root, "child", at(0.0, 0.0, 0.0));

        scene.set_active(child, true);
        assert!(
            !scene.effectively_active(child),
            "inactive root must gate the child"
        );
        scene.set_active(root, true);
        assert!(scene.effectively_active(child));
        scene.set_active(root, false);
        assert!(!scene.effectively_active(child));
    }
}
