use std::io::Read;
use std::path::Path;

use portalsync_protocol::{ErrorCode, NetError};
use sha2::{Digest, Sha256};

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 of an entire file and returns the hex-encoded digest.
pub fn calculate_file_checksum(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Checks a downloaded file against the hex digest the portal advertised.
///
/// Comparison is case-insensitive. A mismatch is a `File` error; an
/// unreadable file is a `File` error carrying the I/O cause.
pub fn verify_file_checksum(path: &Path, expected: &str) -> Result<(), NetError> {
    let actual = calculate_file_checksum(path).map_err(|e| {
        NetError::with_source(
            ErrorCode::File,
            format!("cannot read {}: {e}", path.display()),
            e,
        )
    })?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(NetError::new(
            ErrorCode::File,
            format!(
                "checksum mismatch for {}: expected {expected}, got {actual}",
                path.display()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn checksum_bytes_deterministic() {
        let c1 = checksum_bytes(b"hello world");
        let c2 = checksum_bytes(b"hello world");
        assert_eq!(c1, c2);
        assert_eq!(c1.len(), 64); // SHA-256 = 64 hex chars.
    }

    #[test]
    fn file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.mp4");
        std::fs::write(&path, b"frame data").unwrap();

        assert_eq!(
            calculate_file_checksum(&path).unwrap(),
            checksum_bytes(b"frame data")
        );
    }

    #[test]
    fn verify_accepts_uppercase_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();

        let digest = checksum_bytes(b"abc").to_uppercase();
        verify_file_checksum(&path, &digest).unwrap();
    }

    #[test]
    fn verify_rejects_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"abc").unwrap();

        let err = verify_file_checksum(&path, &checksum_bytes(b"abd")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::File);
        assert!(err.description().contains("checksum mismatch"));
    }

    #[test]
    fn verify_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = verify_file_checksum(&dir.path().join("gone"), "00").unwrap_err();
        assert_eq!(err.code(), ErrorCode::File);
    }
}
