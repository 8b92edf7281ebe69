//! Bounded concurrent document loader for `docs.load`.
//!
//! Source specifications name inline literals, files, directories, or glob
//! patterns. The loader:
//!
//! 1. Expands directory and glob sources into concrete file paths
//!    (deterministically sorted), collecting expansion failures as errors.
//! 2. Reads all concrete sources as concurrent tasks behind a counting
//!    semaphore of capacity `max_concurrent_loads`, so at most that many
//!    files are held in memory simultaneously. Every file is checked against
//!    `max_file_size_mb` before it is read.
//! 3. Collects successes and failures independently: one bad source never
//!    cancels its siblings. Failures become short error strings carrying the
//!    offending path or spec.
//!
//! Committing the resulting rows (a single batch insert) and invalidating the
//! session's index caches is the runtime's job; the loader only produces
//! documents and errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use globset::{Glob, GlobSetBuilder};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use walkdir::WalkDir;

use crate::blobs::BlobStore;
use crate::errors::LoadError;
use crate::models::{estimate_tokens, generate_id, Document, DocumentSource};

/// A single source specification in a `docs.load` request.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Literal content supplied with the call.
    Inline {
        content: String,
        #[serde(default)]
        token_count_hint: Option<i64>,
    },
    /// A single file path.
    File {
        path: PathBuf,
        #[serde(default)]
        token_count_hint: Option<i64>,
    },
    /// All files under a directory, optionally recursive and glob-filtered.
    Directory {
        path: PathBuf,
        #[serde(default)]
        recursive: bool,
        #[serde(default)]
        include_globs: Vec<String>,
        #[serde(default)]
        exclude_globs: Vec<String>,
    },
    /// A glob pattern rooted at its literal (non-glob) prefix.
    Glob { pattern: String },
}

/// One loadable unit after expansion.
#[derive(Debug, Clone)]
enum ConcreteSource {
    Inline {
        content: String,
        token_count_hint: Option<i64>,
    },
    File {
        path: PathBuf,
        token_count_hint: Option<i64>,
    },
}

/// Everything `docs.load` needs back from the loader.
#[derive(Debug, Default)]
pub struct LoadOutcome {
    pub documents: Vec<Document>,
    pub errors: Vec<String>,
}

/// Expand and load all sources for a session.
///
/// Results preserve the expansion order regardless of task completion order,
/// so repeated calls over the same inputs produce identically ordered output.
pub async fn load_sources(
    blobs: &BlobStore,
    semaphore: Arc<Semaphore>,
    session_id: &str,
    specs: &[SourceSpec],
    max_file_size_mb: u64,
) -> LoadOutcome {
    let mut outcome = LoadOutcome::default();

    // Phase 1: expansion.
    let mut concrete: Vec<ConcreteSource> = Vec::new();
    for spec in specs {
        match expand_spec(spec) {
            Ok(sources) => concrete.extend(sources),
            Err(e) => outcome.errors.push(e.to_string()),
        }
    }

    // Phase 2: concurrent reads, bounded by the semaphore.
    let mut tasks: JoinSet<(usize, Result<Document, LoadError>)> = JoinSet::new();
    for (i, source) in concrete.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let blobs = blobs.clone();
        let session_id = session_id.to_string();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("load semaphore never closes");
            let result = load_one(&blobs, &session_id, source, max_file_size_mb).await;
            (i, result)
        });
    }

    let mut slots: Vec<Option<Result<Document, LoadError>>> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((i, result)) => {
                if slots.len() <= i {
                    slots.resize_with(i + 1, || None);
                }
                slots[i] = Some(result);
            }
            Err(e) => outcome.errors.push(format!("Load task failed: {e}")),
        }
    }

    for slot in slots.into_iter().flatten() {
        match slot {
            Ok(document) => outcome.documents.push(document),
            Err(e) => outcome.errors.push(e.to_string()),
        }
    }

    outcome
}

fn expand_spec(spec: &SourceSpec) -> Result<Vec<ConcreteSource>, LoadError> {
    match spec {
        SourceSpec::Inline {
            content,
            token_count_hint,
        } => Ok(vec![ConcreteSource::Inline {
            content: content.clone(),
            token_count_hint: *token_count_hint,
        }]),
        SourceSpec::File {
            path,
            token_count_hint,
        } => Ok(vec![ConcreteSource::File {
            path: path.clone(),
            token_count_hint: *token_count_hint,
        }]),
        SourceSpec::Directory {
            path,
            recursive,
            include_globs,
            exclude_globs,
        } => expand_directory(path, *recursive, include_globs, exclude_globs),
        SourceSpec::Glob { pattern } => expand_glob(pattern),
    }
}

fn expand_directory(
    root: &Path,
    recursive: bool,
    include_globs: &[String],
    exclude_globs: &[String],
) -> Result<Vec<ConcreteSource>, LoadError> {
    if !root.is_dir() {
        return Err(LoadError::FileNotFound {
            path: root.display().to_string(),
        });
    }

    let include = build_globset(include_globs).map_err(|e| LoadError::InvalidSpec {
        message: format!("bad include glob in directory source: {e}"),
    })?;
    let exclude = build_globset(exclude_globs).map_err(|e| LoadError::InvalidSpec {
        message: format!("bad exclude glob in directory source: {e}"),
    })?;

    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root).max_depth(max_depth) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                return Err(LoadError::Io {
                    path: root.display().to_string(),
                    message: e.to_string(),
                })
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let rel_str = relative.to_string_lossy();
        if !exclude_globs.is_empty() && exclude.is_match(rel_str.as_ref()) {
            continue;
        }
        if !include_globs.is_empty() && !include.is_match(rel_str.as_ref()) {
            continue;
        }
        paths.push(entry.path().to_path_buf());
    }

    paths.sort();
    Ok(paths
        .into_iter()
        .map(|path| ConcreteSource::File {
            path,
            token_count_hint: None,
        })
        .collect())
}

fn expand_glob(pattern: &str) -> Result<Vec<ConcreteSource>, LoadError> {
    let glob = Glob::new(pattern).map_err(|e| LoadError::InvalidSpec {
        message: format!("bad glob pattern '{pattern}': {e}"),
    })?;
    let matcher = glob.compile_matcher();

    // Walk from the longest literal prefix so "**" patterns don't force a
    // scan of the filesystem root.
    let root = literal_prefix(pattern);
    if !root.exists() {
        return Err(LoadError::FileNotFound {
            path: root.display().to_string(),
        });
    }

    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_file() && matcher.is_match(entry.path()) {
            paths.push(entry.path().to_path_buf());
        }
    }

    paths.sort();
    Ok(paths
        .into_iter()
        .map(|path| ConcreteSource::File {
            path,
            token_count_hint: None,
        })
        .collect())
}

/// Path components of `pattern` before the first glob metacharacter.
fn literal_prefix(pattern: &str) -> PathBuf {
    let mut prefix = PathBuf::new();
    for component in Path::new(pattern).components() {
        let s = component.as_os_str().to_string_lossy();
        if s.contains(['*', '?', '[', '{']) {
            break;
        }
        prefix.push(component);
    }
    if prefix.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        prefix
    }
}

fn build_globset(patterns: &[String]) -> Result<globset::GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    builder.build()
}

async fn load_one(
    blobs: &BlobStore,
    session_id: &str,
    source: ConcreteSource,
    max_file_size_mb: u64,
) -> Result<Document, LoadError> {
    match source {
        ConcreteSource::Inline {
            content,
            token_count_hint,
        } => {
            let content_hash = blobs.put(content.as_bytes()).map_err(|e| LoadError::Io {
                path: "inline".to_string(),
                message: e.to_string(),
            })?;
            Ok(Document {
                id: generate_id(),
                session_id: session_id.to_string(),
                content_hash,
                source: DocumentSource::Inline,
                length_chars: content.len(),
                length_tokens_est: estimate_tokens(content.len(), token_count_hint),
                metadata: Default::default(),
                created_at: Utc::now(),
            })
        }
        ConcreteSource::File {
            path,
            token_count_hint,
        } => {
            let display = path.display().to_string();
            let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    LoadError::FileNotFound {
                        path: display.clone(),
                    }
                } else {
                    LoadError::Io {
                        path: display.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            if !metadata.is_file() {
                return Err(LoadError::InvalidSpec {
                    message: format!("not a file: {display}"),
                });
            }

            let limit_bytes = max_file_size_mb * 1024 * 1024;
            if metadata.len() > limit_bytes {
                return Err(LoadError::FileTooLarge {
                    path: display,
                    size_mb: metadata.len() as f64 / (1024.0 * 1024.0),
                    limit_mb: max_file_size_mb,
                });
            }

            let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::InvalidData {
                    LoadError::DecodeError {
                        path: display.clone(),
                    }
                } else {
                    LoadError::Io {
                        path: display.clone(),
                        message: e.to_string(),
                    }
                }
            })?;

            let content_hash = blobs.put(content.as_bytes()).map_err(|e| LoadError::Io {
                path: display.clone(),
                message: e.to_string(),
            })?;

            let mut doc_metadata = serde_json::Map::new();
            if let Some(name) = path.file_name() {
                doc_metadata.insert(
                    "filename".to_string(),
                    serde_json::Value::String(name.to_string_lossy().to_string()),
                );
            }

            Ok(Document {
                id: generate_id(),
                session_id: session_id.to_string(),
                content_hash,
                source: DocumentSource::File { path: display },
                length_chars: content.len(),
                length_tokens_est: estimate_tokens(content.len(), token_count_hint),
                metadata: doc_metadata,
                created_at: Utc::now(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, BlobStore) {
        let tmp = TempDir::new().unwrap();
        let blobs = BlobStore::new(tmp.path().join("blobs"));
        (tmp, blobs)
    }

    async fn run(
        blobs: &BlobStore,
        specs: &[SourceSpec],
        max_file_size_mb: u64,
    ) -> LoadOutcome {
        load_sources(
            blobs,
            Arc::new(Semaphore::new(4)),
            "session-1",
            specs,
            max_file_size_mb,
        )
        .await
    }

    #[tokio::test]
    async fn test_inline_sources() {
        let (_tmp, blobs) = setup();
        let outcome = run(
            &blobs,
            &[SourceSpec::Inline {
                content: "hello world".to_string(),
                token_count_hint: None,
            }],
            50,
        )
        .await;

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.documents.len(), 1);
        let doc = &outcome.documents[0];
        assert_eq!(doc.length_chars, 11);
        assert_eq!(doc.length_tokens_est, 3);
        assert_eq!(blobs.get(&doc.content_hash).unwrap().unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_cancel_siblings() {
        let (_tmp, blobs) = setup();
        let outcome = run(
            &blobs,
            &[
                SourceSpec::Inline {
                    content: "ok-1".to_string(),
                    token_count_hint: None,
                },
                SourceSpec::File {
                    path: PathBuf::from("/nonexistent/missing.txt"),
                    token_count_hint: None,
                },
                SourceSpec::Inline {
                    content: "ok-2".to_string(),
                    token_count_hint: None,
                },
            ],
            50,
        )
        .await;

        assert_eq!(outcome.documents.len(), 2);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("missing.txt"));
    }

    #[tokio::test]
    async fn test_file_too_large() {
        let (tmp, blobs) = setup();
        let big = tmp.path().join("big.txt");
        std::fs::write(&big, "x".repeat(2 * 1024 * 1024)).unwrap();

        let outcome = run(
            &blobs,
            &[SourceSpec::File {
                path: big,
                token_count_hint: None,
            }],
            1,
        )
        .await;

        assert!(outcome.documents.is_empty());
        assert!(outcome.errors[0].contains("too large"));
    }

    #[tokio::test]
    async fn test_decode_error() {
        let (tmp, blobs) = setup();
        let binary = tmp.path().join("blob.bin");
        std::fs::write(&binary, [0xFF, 0xFE, 0x00, 0x80]).unwrap();

        let outcome = run(
            &blobs,
            &[SourceSpec::File {
                path: binary,
                token_count_hint: None,
            }],
            50,
        )
        .await;

        assert!(outcome.documents.is_empty());
        assert!(outcome.errors[0].contains("decode"));
    }

    #[tokio::test]
    async fn test_directory_expansion_sorted() {
        let (tmp, blobs) = setup();
        let dir = tmp.path().join("docs");
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("b.txt"), "bravo").unwrap();
        std::fs::write(dir.join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.join("sub/c.txt"), "charlie").unwrap();

        let shallow = run(
            &blobs,
            &[SourceSpec::Directory {
                path: dir.clone(),
                recursive: false,
                include_globs: vec![],
                exclude_globs: vec![],
            }],
            50,
        )
        .await;
        assert_eq!(shallow.documents.len(), 2);
        assert!(shallow.documents[0].source.display().ends_with("a.txt"));

        let deep = run(
            &blobs,
            &[SourceSpec::Directory {
                path: dir,
                recursive: true,
                include_globs: vec!["**/*.txt".to_string()],
                exclude_globs: vec!["b.*".to_string()],
            }],
            50,
        )
        .await;
        assert_eq!(deep.documents.len(), 2);
        let names: Vec<String> = deep
            .documents
            .iter()
            .map(|d| d.display_name())
            .collect();
        assert_eq!(names, vec!["a.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_glob_expansion() {
        let (tmp, blobs) = setup();
        let dir = tmp.path().join("logs");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("one.log"), "first").unwrap();
        std::fs::write(dir.join("two.log"), "second").unwrap();
        std::fs::write(dir.join("skip.txt"), "nope").unwrap();

        let outcome = run(
            &blobs,
            &[SourceSpec::Glob {
                pattern: format!("{}/*.log", dir.display()),
            }],
            50,
        )
        .await;

        assert!(outcome.errors.is_empty());
        assert_eq!(outcome.documents.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_is_an_error() {
        let (_tmp, blobs) = setup();
        let outcome = run(
            &blobs,
            &[SourceSpec::Directory {
                path: PathBuf::from("/no/such/dir"),
                recursive: false,
                include_globs: vec![],
                exclude_globs: vec![],
            }],
            50,
        )
        .await;
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("/no/such/dir"));
    }
}
