//! Local durable object graph.
//!
//! Nodes are typed attribute maps with named set relationships. Mutations
//! accumulate in a working copy; [`ObjectGraph::save`] flushes the whole
//! working copy to the backing store as one chunk, and
//! [`ObjectGraph::rollback`] discards everything since the last save.

mod backing;
mod error;
mod graph;
mod hook;
mod node;

pub use backing::{Backing, JsonFileBacking, MemoryBacking};
pub use error::{FieldError, GraphError};
pub use graph::ObjectGraph;
pub use hook::{EntityHook, Schema};
pub use node::{Node, NodeId, Snapshot};
