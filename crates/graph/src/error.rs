//! Graph error types.

use portalsync_protocol::{Classify, ErrorCode, NetError};

use crate::node::NodeId;

/// Errors produced by the graph and its backing stores.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("{owner}.{relation} refers to missing node {target}")]
    DanglingReference {
        owner: NodeId,
        relation: String,
        target: NodeId,
    },

    #[error("backing store rejected commit: {0}")]
    Rejected(String),
}

impl Classify for GraphError {
    fn classify(self) -> NetError {
        let description = format!("commit failed: {self}");
        NetError::with_source(ErrorCode::Storage, description, self)
    }
}

/// A field-level data error reported by an entity hook.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FieldError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("{entity}: missing required field `{field}`")]
    Missing { entity: String, field: String },

    #[error("{entity}: invalid field `{field}`: {reason}")]
    Invalid {
        entity: String,
        field: String,
        reason: String,
    },
}

impl Classify for FieldError {
    fn classify(self) -> NetError {
        let description = self.to_string();
        NetError::with_source(ErrorCode::Json, description, self)
    }
}
