use tracing::{debug, info};

use crate::backing::{Backing, MemoryBacking};
use crate::error::GraphError;
use crate::node::{Node, NodeId, Snapshot};

/// The local object graph.
///
/// Reads and writes go to a working copy. `save` commits the working copy as
/// one chunk; `rollback` reverts it to the last committed chunk. A chunk is
/// only committed when every relationship points at an existing node.
pub struct ObjectGraph {
    committed: Snapshot,
    working: Snapshot,
    dirty: bool,
    backing: Box<dyn Backing>,
    commits: u64,
    rollbacks: u64,
}

impl ObjectGraph {
    /// Opens a graph over `backing`, loading its last committed snapshot.
    pub fn open(mut backing: impl Backing) -> Result<Self, GraphError> {
        let committed = backing.load()?.unwrap_or_default();
        debug!(nodes = committed.len(), "graph opened");
        Ok(Self {
            working: committed.clone(),
            committed,
            dirty: false,
            backing: Box::new(backing),
            commits: 0,
            rollbacks: 0,
        })
    }

    /// An empty graph backed by a private in-memory store.
    pub fn in_memory() -> Self {
        let backing = MemoryBacking::new();
        Self {
            committed: Snapshot::default(),
            working: Snapshot::default(),
            dirty: false,
            backing: Box::new(backing),
            commits: 0,
            rollbacks: 0,
        }
    }

    // -- reads ---------------------------------------------------------------

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.working.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.working.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.working.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.working.nodes.is_empty()
    }

    /// All nodes of the given entity.
    pub fn nodes_of<'a>(&'a self, entity: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.working
            .nodes
            .values()
            .filter(move |n| n.entity() == entity)
    }

    /// First node of `entity` whose attribute `key` equals `value`.
    pub fn find(&self, entity: &str, key: &str, value: &serde_json::Value) -> Option<NodeId> {
        self.nodes_of(entity)
            .find(|n| n.attr(key) == Some(value))
            .map(Node::id)
    }

    /// Members of `owner`'s relationship, in id order.
    pub fn related(&self, owner: NodeId, relation: &str) -> Vec<NodeId> {
        self.get(owner)
            .map(|n| n.related(relation).collect())
            .unwrap_or_default()
    }

    /// The committed state, as it is in durable storage.
    pub fn committed(&self) -> &Snapshot {
        &self.committed
    }

    // -- writes --------------------------------------------------------------

    /// Inserts a node and returns its id.
    pub fn insert(
        &mut self,
        entity: &str,
        attrs: serde_json::Map<String, serde_json::Value>,
    ) -> NodeId {
        self.working.next_id += 1;
        let id = NodeId(self.working.next_id);
        self.working.nodes.insert(id, Node::new(id, entity, attrs));
        self.dirty = true;
        id
    }

    /// Mutable access to a node's attributes.
    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        let node = self.working.nodes.get_mut(&id)?;
        self.dirty = true;
        Some(node)
    }

    pub fn set_attr(
        &mut self,
        id: NodeId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), GraphError> {
        let node = self.get_mut(id).ok_or(GraphError::UnknownNode(id))?;
        node.set_attr(key, value);
        Ok(())
    }

    /// Deletes a node and every relationship pointing at it.
    pub fn delete(&mut self, id: NodeId) -> Option<Node> {
        let removed = self.working.nodes.remove(&id)?;
        for node in self.working.nodes.values_mut() {
            node.unlink_everywhere(id);
        }
        self.dirty = true;
        Some(removed)
    }

    /// Adds `target` to `owner`'s relationship.
    pub fn link(&mut self, owner: NodeId, relation: &str, target: NodeId) -> Result<(), GraphError> {
        if !self.contains(target) {
            return Err(GraphError::UnknownNode(target));
        }
        let node = self
            .working
            .nodes
            .get_mut(&owner)
            .ok_or(GraphError::UnknownNode(owner))?;
        if node.link(relation, target) {
            self.dirty = true;
        }
        Ok(())
    }

    /// Removes `target` from `owner`'s relationship. Returns whether it was a member.
    pub fn unlink(&mut self, owner: NodeId, relation: &str, target: NodeId) -> bool {
        let Some(node) = self.working.nodes.get_mut(&owner) else {
            return false;
        };
        let removed = node.unlink(relation, target);
        if removed {
            self.dirty = true;
        }
        removed
    }

    // -- chunks --------------------------------------------------------------

    /// Whether there are mutations since the last save or rollback.
    pub fn has_changes(&self) -> bool {
        self.dirty
    }

    /// Checks that every relationship resolves to an existing node.
    pub fn validate(&self) -> Result<(), GraphError> {
        for node in self.working.nodes.values() {
            for (relation, targets) in node.relations() {
                if let Some(missing) = targets.iter().find(|t| !self.contains(**t)) {
                    return Err(GraphError::DanglingReference {
                        owner: node.id(),
                        relation: relation.clone(),
                        target: *missing,
                    });
                }
            }
        }
        Ok(())
    }

    /// Commits the working copy as one chunk.
    ///
    /// On error nothing is committed and the working copy is left as is;
    /// the caller decides whether to roll back.
    pub fn save(&mut self) -> Result<(), GraphError> {
        if !self.dirty {
            return Ok(());
        }
        self.validate()?;
        self.backing.store(&self.working)?;
        self.committed = self.working.clone();
        self.dirty = false;
        self.commits += 1;
        debug!(nodes = self.committed.len(), commit = self.commits, "chunk committed");
        Ok(())
    }

    /// Discards every mutation since the last committed chunk.
    pub fn rollback(&mut self) {
        self.working = self.committed.clone();
        self.dirty = false;
        self.rollbacks += 1;
        info!(nodes = self.working.len(), "graph rolled back to last commit");
    }

    /// Chunks committed through this handle.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Rollbacks performed through this handle.
    pub fn rollback_count(&self) -> u64 {
        self.rollbacks
    }
}

impl std::fmt::Debug for ObjectGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectGraph")
            .field("nodes", &self.working.len())
            .field("dirty", &self.dirty)
            .field("commits", &self.commits)
            .field("rollbacks", &self.rollbacks)
            .finish()
    }
}
