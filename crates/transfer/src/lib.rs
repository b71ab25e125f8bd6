//! Response sinks and checksum helpers.
//!
//! A sink accepts the bytes of one network exchange. Two strategies exist:
//! [`MemorySink`] buffers the body for parsing, [`FileSink`] streams it to
//! disk so large downloads never sit in memory.

mod checksum;
mod sink;

pub use checksum::{calculate_file_checksum, checksum_bytes, verify_file_checksum};
pub use sink::{FileSink, MemorySink, ResponseSink, Sink, SinkKind};
