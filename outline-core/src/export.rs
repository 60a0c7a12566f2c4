//! Verified file export.
//!
//! The payload is written to a temporary file, read back and hashed, moved
//! into place and hashed again. Any mismatch fails the export.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::card::Card;
use crate::object::WorkingTree;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Export to {path:?} is corrupt: expected {expected}, found {actual}")]
    IntegrityMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
}

pub type Result<T> = std::result::Result<T, ExportError>;

pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Check that the file at `path` hashes to `expected`
pub fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let actual = content_hash(&fs::read(path)?);
    if actual != expected {
        return Err(ExportError::IntegrityMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Write `payload` to `path`, verifying both copies. Returns the hash.
pub fn export_verified(path: &Path, payload: &[u8]) -> Result<String> {
    let expected = content_hash(payload);
    let tmp_path = path.with_extension("export.tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(payload)?;
        file.sync_all()?;
    }
    if let Err(e) = verify_file(&tmp_path, &expected) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path)?;
    verify_file(path, &expected)?;
    tracing::info!(path = %path.display(), hash = %expected, "export verified");
    Ok(expected)
}

/// JSON rendering of a working tree
pub fn tree_json(tree: &WorkingTree) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(tree)?)
}

/// JSON rendering of a card tree's visible cards
pub fn cards_json(cards: &[Card]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(cards)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_export_verified_writes_payload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        let hash = export_verified(&path, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"{\"a\":1}");
        assert_eq!(hash, content_hash(b"{\"a\":1}"));
        assert!(!path.with_extension("export.tmp").exists());
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.json");
        fs::write(&path, b"tampered").unwrap();
        let err = verify_file(&path, &content_hash(b"original")).unwrap_err();
        assert!(matches!(err, ExportError::IntegrityMismatch { .. }));
    }

    #[test]
    fn test_tree_json() {
        let tree = WorkingTree::leaf("0", "hello");
        let json = String::from_utf8(tree_json(&tree).unwrap()).unwrap();
        assert!(json.contains("hello"));
    }
}
