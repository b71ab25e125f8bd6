use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identifier of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A typed node: an entity name, its attributes, and named set relationships.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    entity: String,
    #[serde(default)]
    attrs: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    relations: BTreeMap<String, BTreeSet<NodeId>>,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        entity: impl Into<String>,
        attrs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            id,
            entity: entity.into(),
            attrs,
            relations: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn attrs(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.attrs
    }

    pub fn attr(&self, key: &str) -> Option<&serde_json::Value> {
        self.attrs.get(key)
    }

    /// String attribute, if present and a string.
    pub fn str_attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(|v| v.as_str())
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attrs.insert(key.into(), value);
    }

    pub fn remove_attr(&mut self, key: &str) -> Option<serde_json::Value> {
        self.attrs.remove(key)
    }

    /// Members of the named relationship.
    pub fn related(&self, relation: &str) -> impl Iterator<Item = NodeId> + '_ {
        self.relations
            .get(relation)
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    pub(crate) fn relations(&self) -> &BTreeMap<String, BTreeSet<NodeId>> {
        &self.relations
    }

    pub(crate) fn link(&mut self, relation: &str, target: NodeId) -> bool {
        self.relations
            .entry(relation.to_string())
            .or_default()
            .insert(target)
    }

    pub(crate) fn unlink(&mut self, relation: &str, target: NodeId) -> bool {
        let Some(set) = self.relations.get_mut(relation) else {
            return false;
        };
        let removed = set.remove(&target);
        if set.is_empty() {
            self.relations.remove(relation);
        }
        removed
    }

    /// Removes `target` from every relationship of this node.
    pub(crate) fn unlink_everywhere(&mut self, target: NodeId) {
        self.relations.retain(|_, set| {
            set.remove(&target);
            !set.is_empty()
        });
    }
}

/// Full contents of a graph at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub(crate) next_id: u64,
    #[serde(with = "nodes_as_list")]
    pub(crate) nodes: BTreeMap<NodeId, Node>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }
}

/// Nodes are stored as a list; JSON object keys must be strings.
mod nodes_as_list {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{Node, NodeId};

    pub fn serialize<S: Serializer>(
        nodes: &BTreeMap<NodeId, Node>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(nodes.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<NodeId, Node>, D::Error> {
        let list = Vec::<Node>::deserialize(deserializer)?;
        Ok(list.into_iter().map(|n| (n.id, n)).collect())
    }
}
