//! Shared types for the PortalSync engine.
//!
//! Everything here is transport-agnostic: the typed error every layer reports
//! with, the request descriptor an operation carries, and the progress sink
//! the orchestrator pushes into.

pub mod constants;
pub mod error;
pub mod progress;
pub mod request;

// Re-export primary types for convenience.
pub use error::{Classify, ErrorCode, NetError};
pub use progress::ProgressReporter;
pub use request::{Method, Request, RequestBody};
