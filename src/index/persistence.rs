//! Index snapshot persistence with atomic writes and fingerprinting.
//!
//! Each session's snapshot lives under its own directory:
//!
//! ```text
//! {index_dir}/
//!     {session_id}/
//!         current           # generation pointer — the only file ever renamed
//!         index.<gen>       # serialized BM25 payload
//!         metadata.<gen>    # IndexMetadata record
//! ```
//!
//! # Write protocol
//!
//! Both payload files of a write share a fresh generation name. They are
//! written and flushed while still invisible to readers, then the write
//! commits with a single rename: `current.tmp` → `current`, where the
//! pointer file holds the generation name. A crash at any point leaves the
//! on-disk state either unchanged (the pointer still names the previous
//! generation, or no generation) or fully updated; index and metadata from
//! different writes can never be paired, because a reader only ever follows
//! the one generation the pointer names. Uncommitted generation files and a
//! stray `current.tmp` are residue, swept on the next read or write.
//!
//! # Read protocol
//!
//! Follow the pointer; if it is absent, unreadable, names a missing or
//! undeserializable generation, or the snapshot's `index_version` is not the
//! running binary's, the persisted index is treated as nonexistent and any
//! residue is deleted.
//!
//! # Staleness
//!
//! A loaded snapshot is fresh iff its metadata matches the session's current
//! document count, document fingerprint, and configured tokenizer name. Any
//! mismatch forces a rebuild and invalidates the snapshot.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::blobs::hash_bytes;
use crate::index::bm25::{Bm25Index, INDEX_VERSION};
use crate::models::generate_id;

const POINTER: &str = "current";
const POINTER_TMP: &str = "current.tmp";

/// Metadata stored beside a persisted index; the staleness discriminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index_version: u32,
    pub created_at: DateTime<Utc>,
    pub doc_count: i64,
    pub tokenizer: String,
    /// SHA-256 over the session's documents' content hashes in ascending
    /// document-id order.
    pub doc_fingerprint: String,
}

impl IndexMetadata {
    /// True when the snapshot no longer matches the session's document set
    /// or the configured tokenizer.
    pub fn is_stale(&self, doc_count: i64, doc_fingerprint: &str, tokenizer: &str) -> bool {
        self.doc_count != doc_count
            || self.doc_fingerprint != doc_fingerprint
            || self.tokenizer != tokenizer
    }
}

/// Compute the document fingerprint from `(id, content_hash)` pairs.
///
/// The pairs must already be in ascending id order (the metadata store's
/// `get_document_fingerprints` contract); the fingerprint is the SHA-256 of
/// the concatenated content hashes.
pub fn compute_doc_fingerprint(pairs: &[(String, String)]) -> String {
    let mut concatenated = String::with_capacity(pairs.len() * 64);
    for (_, content_hash) in pairs {
        concatenated.push_str(content_hash);
    }
    hash_bytes(concatenated.as_bytes())
}

/// Manages on-disk snapshots of per-session BM25 indexes.
#[derive(Debug, Clone)]
pub struct IndexPersistence {
    index_dir: PathBuf,
}

impl IndexPersistence {
    pub fn new(index_dir: impl Into<PathBuf>) -> Self {
        Self {
            index_dir: index_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.index_dir.join(session_id)
    }

    fn index_path(&self, session_id: &str, generation: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("index.{generation}"))
    }

    fn metadata_path(&self, session_id: &str, generation: &str) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("metadata.{generation}"))
    }

    /// Persist a snapshot atomically.
    ///
    /// The pointer rename is the commit point; everything before it is
    /// invisible to readers, and everything after it is the complete new
    /// snapshot.
    pub fn save(
        &self,
        session_id: &str,
        index: &Bm25Index,
        metadata: &IndexMetadata,
    ) -> std::io::Result<()> {
        let dir = self.session_dir(session_id);
        std::fs::create_dir_all(&dir)?;

        let generation = generate_id();
        let index_path = self.index_path(session_id, &generation);
        let metadata_path = self.metadata_path(session_id, &generation);
        let pointer_tmp = dir.join(POINTER_TMP);

        let result = (|| {
            write_flushed(&index_path, &serde_json::to_vec(index)?)?;
            write_flushed(&metadata_path, &serde_json::to_vec(metadata)?)?;
            // The generation's directory entries must be durable before any
            // pointer can name them.
            sync_dir(&dir)?;
            write_flushed(&pointer_tmp, generation.as_bytes())?;
            std::fs::rename(&pointer_tmp, dir.join(POINTER))?;
            sync_dir(&dir)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&index_path);
            let _ = std::fs::remove_file(&metadata_path);
            let _ = std::fs::remove_file(&pointer_tmp);
        } else {
            sweep_stale(&dir, &generation);
            tracing::info!(
                session_id,
                doc_count = metadata.doc_count,
                tokenizer = %metadata.tokenizer,
                "persisted index snapshot"
            );
        }
        result
    }

    /// Load a snapshot, or `None` when absent or unusable.
    ///
    /// Corruption is self-healing: a snapshot that cannot be read is deleted
    /// so the caller falls through to a rebuild. Never surfaces an error to
    /// the caller.
    pub fn load(&self, session_id: &str) -> Option<(Bm25Index, IndexMetadata)> {
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return None;
        }

        // An unrenamed pointer is residue of an interrupted write; whatever
        // it names never became current.
        let _ = std::fs::remove_file(dir.join(POINTER_TMP));

        let generation = match std::fs::read_to_string(dir.join(POINTER)) {
            Ok(raw) => raw.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Generation files without a committed pointer are residue.
                self.invalidate(session_id);
                return None;
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "unreadable snapshot pointer, rebuilding");
                self.invalidate(session_id);
                return None;
            }
        };

        let well_formed = !generation.is_empty()
            && generation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !well_formed {
            tracing::warn!(session_id, "malformed snapshot pointer, rebuilding");
            self.invalidate(session_id);
            return None;
        }

        let index_path = self.index_path(session_id, &generation);
        let metadata_path = self.metadata_path(session_id, &generation);

        // Metadata first: it is small and validates fastest.
        let parsed = (|| -> std::io::Result<(Bm25Index, IndexMetadata)> {
            let metadata: IndexMetadata = serde_json::from_slice(&std::fs::read(&metadata_path)?)?;
            let index: Bm25Index = serde_json::from_slice(&std::fs::read(&index_path)?)?;
            Ok((index, metadata))
        })();

        match parsed {
            Ok((index, metadata))
                if metadata.index_version == INDEX_VERSION
                    && index.index_version == INDEX_VERSION =>
            {
                sweep_stale(&dir, &generation);
                Some((index, metadata))
            }
            Ok((_, metadata)) => {
                tracing::warn!(
                    session_id,
                    snapshot_version = metadata.index_version,
                    running_version = INDEX_VERSION,
                    "index snapshot version mismatch, rebuilding"
                );
                self.invalidate(session_id);
                None
            }
            Err(e) => {
                tracing::warn!(session_id, error = %e, "corrupt index snapshot, rebuilding");
                self.invalidate(session_id);
                None
            }
        }
    }

    /// Delete the persisted snapshot for a session, if any.
    pub fn invalidate(&self, session_id: &str) {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                tracing::warn!(session_id, error = %e, "failed to invalidate index snapshot");
            } else {
                tracing::info!(session_id, "invalidated index snapshot");
            }
        }
    }
}

/// Remove everything in the snapshot directory that is not the pointer or a
/// payload file of the generation to keep.
fn sweep_stale(dir: &Path, keep: &str) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    let keep_index = format!("index.{keep}");
    let keep_metadata = format!("metadata.{keep}");
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == POINTER || name == keep_index || name == keep_metadata {
            continue;
        }
        let _ = std::fs::remove_file(entry.path());
    }
}

fn write_flushed(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    // Directory handles cannot be fsynced on this platform.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tokenizer::{Tokenizer, UnicodeTokenizer};
    use tempfile::TempDir;

    fn index_of(docs: &[(&str, &str)]) -> Bm25Index {
        let tokenizer = UnicodeTokenizer;
        Bm25Index::build(
            tokenizer.name(),
            docs.iter()
                .map(|(id, text)| (id.to_string(), tokenizer.tokenize(text))),
        )
    }

    fn sample_index() -> Bm25Index {
        index_of(&[("d1", "alpha beta gamma"), ("d2", "delta epsilon")])
    }

    fn sample_metadata(fingerprint: &str) -> IndexMetadata {
        IndexMetadata {
            index_version: INDEX_VERSION,
            created_at: Utc::now(),
            doc_count: 2,
            tokenizer: "unicode-v1".to_string(),
            doc_fingerprint: fingerprint.to_string(),
        }
    }

    fn current_generation(dir: &Path) -> String {
        std::fs::read_to_string(dir.join("current")).unwrap()
    }

    #[test]
    fn test_save_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));

        let index = sample_index();
        let metadata = sample_metadata("f1");
        persistence.save("s1", &index, &metadata).unwrap();

        let (loaded, loaded_meta) = persistence.load("s1").unwrap();
        assert_eq!(loaded.doc_ids, index.doc_ids);
        assert_eq!(loaded_meta, metadata);
    }

    #[test]
    fn test_no_residue_after_save() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        persistence
            .save("s1", &sample_index(), &sample_metadata("f1"))
            .unwrap();

        let dir = tmp.path().join("indexes/s1");
        let generation = current_generation(&dir);
        let mut names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "current".to_string(),
                format!("index.{generation}"),
                format!("metadata.{generation}"),
            ]
        );
    }

    #[test]
    fn test_overwrite_sweeps_previous_generation() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        persistence
            .save("s1", &sample_index(), &sample_metadata("f1"))
            .unwrap();
        let dir = tmp.path().join("indexes/s1");
        let first_generation = current_generation(&dir);

        persistence
            .save("s1", &sample_index(), &sample_metadata("f2"))
            .unwrap();
        let second_generation = current_generation(&dir);
        assert_ne!(first_generation, second_generation);
        assert!(!dir.join(format!("index.{first_generation}")).exists());
        assert!(!dir.join(format!("metadata.{first_generation}")).exists());

        let (_, metadata) = persistence.load("s1").unwrap();
        assert_eq!(metadata.doc_fingerprint, "f2");
    }

    #[test]
    fn test_missing_snapshot_is_none() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        assert!(persistence.load("never-saved").is_none());
    }

    #[test]
    fn test_corrupt_snapshot_self_heals() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        persistence
            .save("s1", &sample_index(), &sample_metadata("f1"))
            .unwrap();

        let dir = tmp.path().join("indexes/s1");
        let generation = current_generation(&dir);
        std::fs::write(dir.join(format!("index.{generation}")), b"not json").unwrap();

        assert!(persistence.load("s1").is_none());
        // The broken snapshot directory was removed.
        assert!(!dir.exists());
    }

    #[test]
    fn test_pointer_to_missing_generation_self_heals() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        let dir = tmp.path().join("indexes/s1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("current"), b"gone").unwrap();

        assert!(persistence.load("s1").is_none());
        assert!(!dir.exists());
    }

    #[test]
    fn test_uncommitted_generation_is_residue() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        let dir = tmp.path().join("indexes/s1");
        std::fs::create_dir_all(&dir).unwrap();
        // A first write that crashed before the pointer rename: payload
        // files (and possibly the unrenamed pointer) exist, nothing is
        // committed.
        std::fs::write(dir.join("index.g1"), b"{}").unwrap();
        std::fs::write(dir.join("metadata.g1"), b"{}").unwrap();
        std::fs::write(dir.join("current.tmp"), b"g1").unwrap();

        assert!(persistence.load("s1").is_none());
        assert!(!dir.exists(), "uncommitted residue must be deleted");
    }

    #[test]
    fn test_version_mismatch_treated_as_stale() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        let mut index = sample_index();
        index.index_version = 99;
        let mut metadata = sample_metadata("f1");
        metadata.index_version = 99;
        persistence.save("s1", &index, &metadata).unwrap();

        assert!(persistence.load("s1").is_none());
        assert!(!tmp.path().join("indexes/s1").exists());
    }

    #[test]
    fn test_staleness_checks() {
        let metadata = sample_metadata("f1");
        assert!(!metadata.is_stale(2, "f1", "unicode-v1"));
        assert!(metadata.is_stale(3, "f1", "unicode-v1"));
        assert!(metadata.is_stale(2, "f2", "unicode-v1"));
        assert!(metadata.is_stale(2, "f1", "other-v2"));
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let a = compute_doc_fingerprint(&[("d1".into(), "aaaa".into())]);
        let b = compute_doc_fingerprint(&[("d1".into(), "bbbb".into())]);
        let c = compute_doc_fingerprint(&[
            ("d1".into(), "aaaa".into()),
            ("d2".into(), "cccc".into()),
        ]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        // Deterministic.
        assert_eq!(a, compute_doc_fingerprint(&[("d1".into(), "aaaa".into())]));
    }

    #[test]
    fn test_interrupted_overwrite_loads_previous_snapshot() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        let old_index = index_of(&[("d1", "alpha beta"), ("d2", "gamma delta")]);
        persistence
            .save("s1", &old_index, &sample_metadata("f1"))
            .unwrap();
        let dir = tmp.path().join("indexes/s1");
        let old_generation = current_generation(&dir);

        // A second write that crashed at the worst possible point: both new
        // payload files fully written and flushed, the new pointer written,
        // only the commit rename missing.
        let new_index = index_of(&[("d9", "omega")]);
        let mut new_metadata = sample_metadata("f2");
        new_metadata.doc_count = 1;
        std::fs::write(
            dir.join("index.g2"),
            serde_json::to_vec(&new_index).unwrap(),
        )
        .unwrap();
        std::fs::write(
            dir.join("metadata.g2"),
            serde_json::to_vec(&new_metadata).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.join("current.tmp"), b"g2").unwrap();

        // The previous snapshot loads, internally consistent: old index
        // paired with old metadata, never a mix of the two writes.
        let (index, metadata) = persistence.load("s1").unwrap();
        assert_eq!(metadata.doc_fingerprint, "f1");
        assert_eq!(metadata.doc_count, 2);
        assert_eq!(index.doc_ids, vec!["d1".to_string(), "d2".to_string()]);

        // And the interrupted write's residue is gone.
        assert!(!dir.join("current.tmp").exists());
        assert!(!dir.join("index.g2").exists());
        assert!(!dir.join("metadata.g2").exists());
        assert_eq!(current_generation(&dir), old_generation);
    }

    #[test]
    fn test_invalidate_missing_is_noop() {
        let tmp = TempDir::new().unwrap();
        let persistence = IndexPersistence::new(tmp.path().join("indexes"));
        persistence.invalidate("nothing-here");
    }
}
