use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use portalsync_protocol::{Classify, ErrorCode, NetError};
use tracing::{debug, warn};

/// Capability set shared by every response sink.
pub trait ResponseSink {
    /// Accepts the next slice of the response body.
    fn append_data(&mut self, data: &[u8]) -> Result<(), NetError>;

    /// Discards everything accepted so far, so a restarted body starts clean.
    fn reset_data(&mut self) -> Result<(), NetError>;

    /// The buffered body, for sinks that keep it in memory.
    fn data(&self) -> Option<&[u8]>;

    /// Bytes accepted since the last reset.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// MemorySink
// ---------------------------------------------------------------------------

/// Buffers the response body in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    data: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Body decoded as UTF-8, replacing invalid sequences.
    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }

    /// Parses the body as a JSON array.
    pub fn json_array(&self) -> Result<Vec<serde_json::Value>, NetError> {
        match self.json_value()? {
            serde_json::Value::Array(items) => Ok(items),
            other => Err(NetError::new(
                ErrorCode::Json,
                format!("expected a JSON array, got {}", json_kind(&other)),
            )),
        }
    }

    /// Parses the body as a JSON object.
    pub fn json_object(&self) -> Result<serde_json::Map<String, serde_json::Value>, NetError> {
        match self.json_value()? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(NetError::new(
                ErrorCode::Json,
                format!("expected a JSON object, got {}", json_kind(&other)),
            )),
        }
    }

    /// Parses the body as any JSON value.
    pub fn json_value(&self) -> Result<serde_json::Value, NetError> {
        serde_json::from_slice(&self.data).map_err(Classify::classify)
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

impl ResponseSink for MemorySink {
    fn append_data(&mut self, data: &[u8]) -> Result<(), NetError> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn reset_data(&mut self) -> Result<(), NetError> {
        self.data.clear();
        Ok(())
    }

    fn data(&self) -> Option<&[u8]> {
        Some(&self.data)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

/// Streams the response body to a file.
///
/// The handle is owned by this sink alone. Dropping the sink closes the
/// handle but keeps the file; call [`FileSink::discard`] to remove a partial
/// download.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: File,
    written: u64,
}

impl FileSink {
    /// Creates (or truncates) the file at `path`, creating parent directories.
    pub fn create(path: &Path) -> Result<Self, NetError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| file_error(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| file_error(path, e))?;
        debug!(path = %path.display(), "file sink opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flushes buffered bytes to the operating system.
    pub fn finish(&mut self) -> Result<(), NetError> {
        self.file.flush().map_err(|e| file_error(&self.path, e))
    }

    /// Closes the handle and removes the file.
    pub fn discard(self) {
        let Self { path, file, .. } = self;
        drop(file);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "partial download removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial download"),
        }
    }
}

fn file_error(path: &Path, e: std::io::Error) -> NetError {
    NetError::with_source(ErrorCode::File, format!("{}: {e}", path.display()), e)
}

impl ResponseSink for FileSink {
    fn append_data(&mut self, data: &[u8]) -> Result<(), NetError> {
        self.file
            .write_all(data)
            .map_err(|e| file_error(&self.path, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn reset_data(&mut self) -> Result<(), NetError> {
        self.file
            .set_len(0)
            .and_then(|()| self.file.seek(SeekFrom::Start(0)).map(|_| ()))
            .map_err(|e| file_error(&self.path, e))?;
        self.written = 0;
        Ok(())
    }

    fn data(&self) -> Option<&[u8]> {
        None
    }

    fn len(&self) -> u64 {
        self.written
    }
}

// ---------------------------------------------------------------------------
// Sink
// ---------------------------------------------------------------------------

/// Which sink strategy an operation uses. Survives retries; the sink itself
/// is recreated for every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    Memory,
    File(PathBuf),
}

impl SinkKind {
    /// Opens a fresh, empty sink of this kind.
    pub fn open(&self) -> Result<Sink, NetError> {
        match self {
            SinkKind::Memory => Ok(Sink::Memory(MemorySink::new())),
            SinkKind::File(path) => FileSink::create(path).map(Sink::File),
        }
    }
}

/// A response sink of either strategy.
#[derive(Debug)]
pub enum Sink {
    Memory(MemorySink),
    File(FileSink),
}

impl Sink {
    pub fn as_memory(&self) -> Option<&MemorySink> {
        match self {
            Sink::Memory(m) => Some(m),
            Sink::File(_) => None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Sink::Memory(_) => None,
            Sink::File(f) => Some(f.path()),
        }
    }

    /// Flushes a file sink; no-op for memory.
    pub fn finish(&mut self) -> Result<(), NetError> {
        match self {
            Sink::Memory(_) => Ok(()),
            Sink::File(f) => f.finish(),
        }
    }

    /// Drops the accepted bytes, removing the file of a file sink.
    pub fn discard(self) {
        if let Sink::File(f) = self {
            f.discard();
        }
    }
}

impl ResponseSink for Sink {
    fn append_data(&mut self, data: &[u8]) -> Result<(), NetError> {
        match self {
            Sink::Memory(m) => m.append_data(data),
            Sink::File(f) => f.append_data(data),
        }
    }

    fn reset_data(&mut self) -> Result<(), NetError> {
        match self {
            Sink::Memory(m) => m.reset_data(),
            Sink::File(f) => f.reset_data(),
        }
    }

    fn data(&self) -> Option<&[u8]> {
        match self {
            Sink::Memory(m) => m.data(),
            Sink::File(f) => f.data(),
        }
    }

    fn len(&self) -> u64 {
        match self {
            Sink::Memory(m) => m.len(),
            Sink::File(f) => f.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_sink_accumulates_and_resets() {
        let mut sink = MemorySink::new();
        sink.append_data(b"[1,").unwrap();
        sink.append_data(b"2]").unwrap();
        assert_eq!(sink.bytes(), b"[1,2]");
        assert_eq!(sink.json_array().unwrap().len(), 2);

        sink.reset_data().unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn memory_sink_json_object() {
        let mut sink = MemorySink::new();
        sink.append_data(br#"{"id":"v1","title":"Knee"}"#).unwrap();
        let map = sink.json_object().unwrap();
        assert_eq!(map["id"], "v1");
    }

    #[test]
    fn memory_sink_malformed_json_is_json_error() {
        let mut sink = MemorySink::new();
        sink.append_data(b"{\"id\":").unwrap();
        assert_eq!(sink.json_object().unwrap_err().code(), ErrorCode::Json);
        assert_eq!(sink.json_array().unwrap_err().code(), ErrorCode::Json);
    }

    #[test]
    fn memory_sink_wrong_shape_is_json_error() {
        let mut sink = MemorySink::new();
        sink.append_data(b"[]").unwrap();
        let err = sink.json_object().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Json);
        assert!(err.description().contains("an array"));
    }

    #[test]
    fn file_sink_reset_leaves_no_residue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("media/v1.mp4");
        let mut sink = FileSink::create(&path).unwrap();

        sink.append_data(b"partial body from an aborted attempt").unwrap();
        sink.reset_data().unwrap();
        sink.append_data(b"fresh").unwrap();
        sink.finish().unwrap();

        assert_eq!(sink.len(), 5);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
        assert_eq!(std::fs::read(&path).unwrap(), b"fresh");
    }

    #[test]
    fn file_sink_create_truncates_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.mp4");
        std::fs::write(&path, b"stale contents").unwrap();

        let mut sink = FileSink::create(&path).unwrap();
        sink.append_data(b"new").unwrap();
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn file_sink_discard_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("v.mp4");
        let mut sink = FileSink::create(&path).unwrap();
        sink.append_data(b"half").unwrap();
        sink.discard();
        assert!(!path.exists());
    }

    #[test]
    fn file_sink_unwritable_path_is_file_error() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        // A regular file where a directory is expected.
        let err = FileSink::create(&blocker.join("v.mp4")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::File);
    }

    #[test]
    fn sink_kind_opens_matching_variant() {
        let dir = TempDir::new().unwrap();
        let memory = SinkKind::Memory.open().unwrap();
        assert!(memory.as_memory().is_some());
        assert!(memory.data().is_some());

        let file = SinkKind::File(dir.path().join("a.bin")).open().unwrap();
        assert!(file.as_memory().is_none());
        assert!(file.data().is_none());
        assert_eq!(file.path(), Some(dir.path().join("a.bin").as_path()));
    }
}
