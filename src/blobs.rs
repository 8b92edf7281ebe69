//! Content-addressed blob store.
//!
//! The address of a byte string is its SHA-256 digest, rendered as lowercase
//! hex. Layout on disk is a two-level fanout by the first two hex characters:
//!
//! ```text
//! {blob_dir}/{hash[..2]}/{hash}
//! ```
//!
//! Identical bytes loaded in two sessions share a single blob while each
//! session keeps its own document identifiers. The store is append-only and
//! key-safe: writers for the same key produce identical files, so no locking
//! is needed.
//!
//! A blob is durable only after both the object file and its directory entry
//! are flushed; writes go through a temp file and an atomic rename. Objects
//! whose bytes no longer match their key are treated as absent.

use sha2::{Digest, Sha256};
use std::io::{Result, Write};
use std::path::{Path, PathBuf};

/// Content-addressed blob storage rooted at a single directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    blob_dir: PathBuf,
}

/// Compute the SHA-256 hex digest of a byte string without storing it.
///
/// Also used for span content hashes and document fingerprints.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl BlobStore {
    pub fn new(blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob_dir: blob_dir.into(),
        }
    }

    fn object_path(&self, content_hash: &str) -> PathBuf {
        self.blob_dir.join(&content_hash[..2]).join(content_hash)
    }

    /// Store bytes and return their hash. Idempotent: writing the same bytes
    /// twice returns the same hash and leaves a single stored copy.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let content_hash = hash_bytes(bytes);
        let subdir = self.blob_dir.join(&content_hash[..2]);
        let path = subdir.join(&content_hash);

        if path.exists() {
            return Ok(content_hash);
        }

        std::fs::create_dir_all(&subdir)?;

        // Temp file + rename keeps concurrent writers of the same key safe
        // and never exposes a partial object.
        let tmp = subdir.join(format!(".{}.tmp-{}", content_hash, std::process::id()));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e);
        }
        sync_dir(&subdir)?;

        Ok(content_hash)
    }

    /// Retrieve full bytes by hash, or `None` if absent.
    ///
    /// An object whose rehash does not match its key is corrupt and reported
    /// as absent.
    pub fn get(&self, content_hash: &str) -> Result<Option<Vec<u8>>> {
        if content_hash.len() < 2 {
            return Ok(None);
        }
        let path = self.object_path(content_hash);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };

        if hash_bytes(&bytes) != content_hash {
            tracing::warn!(content_hash, "corrupt blob: stored bytes do not match key");
            return Ok(None);
        }

        Ok(Some(bytes))
    }

    /// Retrieve bytes in `[start, end)`, clamped to the stored length.
    /// Returns `None` if the key is absent (or corrupt).
    pub fn get_slice(&self, content_hash: &str, start: usize, end: usize) -> Result<Option<Vec<u8>>> {
        let Some(bytes) = self.get(content_hash)? else {
            return Ok(None);
        };
        let start = start.min(bytes.len());
        let end = end.clamp(start, bytes.len());
        Ok(Some(bytes[start..end].to_vec()))
    }

    /// Check presence by hash without reading the object.
    pub fn exists(&self, content_hash: &str) -> bool {
        content_hash.len() >= 2 && self.object_path(content_hash).exists()
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    // Directory handles cannot be fsynced on this platform.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path().join("blobs"));
        (tmp, store)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_tmp, store) = store();
        let hash = store.put(b"hello world").unwrap();
        assert_eq!(store.get(&hash).unwrap().unwrap(), b"hello world");
    }

    #[test]
    fn test_put_is_idempotent() {
        let (_tmp, store) = store();
        let h1 = store.put(b"same bytes").unwrap();
        let h2 = store.put(b"same bytes").unwrap();
        assert_eq!(h1, h2);

        // Exactly one object on disk.
        let subdir = store.blob_dir.join(&h1[..2]);
        let count = std::fs::read_dir(subdir).unwrap().count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_hash_is_lowercase_hex() {
        let (_tmp, store) = store();
        let hash = store.put(b"abc").unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        // Known SHA-256 of "abc".
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_get_absent() {
        let (_tmp, store) = store();
        assert!(store.get(&"0".repeat(64)).unwrap().is_none());
        assert!(!store.exists(&"0".repeat(64)));
    }

    #[test]
    fn test_get_slice_clamps() {
        let (_tmp, store) = store();
        let hash = store.put(b"0123456789").unwrap();
        assert_eq!(store.get_slice(&hash, 2, 5).unwrap().unwrap(), b"234");
        assert_eq!(store.get_slice(&hash, 8, 100).unwrap().unwrap(), b"89");
        assert_eq!(store.get_slice(&hash, 50, 60).unwrap().unwrap(), b"");
    }

    #[test]
    fn test_corrupt_object_is_absent() {
        let (_tmp, store) = store();
        let hash = store.put(b"original").unwrap();
        std::fs::write(store.object_path(&hash), b"tampered").unwrap();
        assert!(store.get(&hash).unwrap().is_none());
        assert!(store.get_slice(&hash, 0, 4).unwrap().is_none());
    }

    #[test]
    fn test_no_temp_files_after_put() {
        let (_tmp, store) = store();
        let hash = store.put(b"clean write").unwrap();
        let subdir = store.blob_dir.join(&hash[..2]);
        for entry in std::fs::read_dir(subdir).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().to_string();
            assert!(!name.contains(".tmp-"), "leftover temp file: {name}");
        }
    }
}
