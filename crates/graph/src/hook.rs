//! Entity construction hooks.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::FieldError;
use crate::graph::ObjectGraph;
use crate::node::NodeId;

/// Builds a typed node from a field dictionary.
///
/// Implementations either insert one complete node and return its id, or
/// report a [`FieldError`] and leave the graph untouched.
pub trait EntityHook: Send {
    fn construct(
        &self,
        graph: &mut ObjectGraph,
        entity: &str,
        fields: &Map<String, Value>,
    ) -> Result<NodeId, FieldError>;
}

impl<F> EntityHook for F
where
    F: Fn(&mut ObjectGraph, &str, &Map<String, Value>) -> Result<NodeId, FieldError> + Send,
{
    fn construct(
        &self,
        graph: &mut ObjectGraph,
        entity: &str,
        fields: &Map<String, Value>,
    ) -> Result<NodeId, FieldError> {
        self(graph, entity, fields)
    }
}

/// Table-driven hook: each known entity lists its required fields.
///
/// Every field of the dictionary is copied onto the node. A required field
/// that is absent or `null` rejects the whole dictionary.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: BTreeMap<String, Vec<String>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `entity` with its required fields.
    pub fn entity(mut self, entity: &str, required: &[&str]) -> Self {
        self.entities.insert(
            entity.to_string(),
            required.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    pub fn knows(&self, entity: &str) -> bool {
        self.entities.contains_key(entity)
    }

    /// Checks `fields` against the entity's required list without touching a graph.
    pub fn check(&self, entity: &str, fields: &Map<String, Value>) -> Result<(), FieldError> {
        let required = self
            .entities
            .get(entity)
            .ok_or_else(|| FieldError::UnknownEntity(entity.to_string()))?;
        for field in required {
            match fields.get(field) {
                None | Some(Value::Null) => {
                    return Err(FieldError::Missing {
                        entity: entity.to_string(),
                        field: field.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl EntityHook for Schema {
    fn construct(
        &self,
        graph: &mut ObjectGraph,
        entity: &str,
        fields: &Map<String, Value>,
    ) -> Result<NodeId, FieldError> {
        self.check(entity, fields)?;
        Ok(graph.insert(entity, fields.clone()))
    }
}
