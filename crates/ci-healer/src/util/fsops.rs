//! Atomic file writes and content hashing.
//!
//! Grounded on `ota::binary_swapper::BinarySwapper`: write to a sibling temp
//! path, then `rename` into place (atomic on the same filesystem), and hash
//! with SHA-256 to verify rollback correctness (spec §4.6 step 1/5, §8
//! property 1).

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Write `contents` to `path` via a sibling temp file + atomic rename.
pub fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .context("target path has no parent directory")?;
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .context("failed to create sibling temp file for atomic write")?;
    std::fs::write(tmp.path(), contents)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to rename temp file into {}", path.display()))?;
    Ok(())
}

/// SHA-256 hash of a file's contents, hex-encoded.
pub fn file_hash(path: &Path) -> Result<String> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

/// SHA-256 hash of an in-memory string, hex-encoded (used to compare
/// pre-apply content against post-rollback content without re-reading disk).
pub fn string_hash(contents: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(contents.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.py");
        std::fs::write(&path, "original").unwrap();
        atomic_write(&path, "patched").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "patched");
    }

    #[test]
    fn rollback_restores_identical_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("file.py");
        let original = "def f():\n    pass\n";
        std::fs::write(&path, original).unwrap();
        let before_hash = file_hash(&path).unwrap();

        atomic_write(&path, "def f(:\n    pass\n").unwrap();
        atomic_write(&path, original).unwrap();

        let after_hash = file_hash(&path).unwrap();
        assert_eq!(before_hash, after_hash);
        assert_eq!(before_hash, string_hash(original));
    }
}
