//! Session runtime: the component every tool call flows through.
//!
//! The engine owns the blob store, the metadata store, the index persistence
//! directory, the configuration, the session-lock map, and the in-memory
//! index cache. A single constructor returns the handle; there is no
//! process-global state, and tests construct a fresh engine rooted at a
//! temp directory.
//!
//! # Concurrency model
//!
//! Single-process, cooperative. Per-session `tokio::sync::Mutex` instances
//! guard the in-memory index cache, the on-disk snapshot, and the close-time
//! persistence section. A second, top-level mutex guards insertion and
//! removal in the session → lock map, and is only ever held for O(1)
//! operations. Locks are in-memory: running two engine processes against the
//! same data directory is outside the contract.
//!
//! # Three-tier index retrieval
//!
//! `get_or_build_index` runs under the session lock and tries, in order:
//!
//! 1. the in-memory cache (`hit-memory`),
//! 2. the on-disk snapshot, if its fingerprint is fresh (`hit-disk`),
//! 3. a rebuild from blob contents, which repopulates the cache.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};

use crate::blobs::BlobStore;
use crate::config::ServerConfig;
use crate::errors::{EngineError, Result};
use crate::index::bm25::Bm25Index;
use crate::index::persistence::{compute_doc_fingerprint, IndexPersistence};
use crate::index::tokenizer::Tokenizer;
use crate::models::{Document, Session, SessionStatus};
use crate::store::Database;

/// Documents longer than this are truncated into the index.
pub const INDEX_DOC_CHAR_CAP: usize = 1_000_000;

/// How many documents a single index build will cover.
pub const INDEX_BUILD_LIMIT: i64 = 100_000;

/// Which tier satisfied an index retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexTier {
    /// In-memory cache hit.
    Memory,
    /// Loaded from a fresh on-disk snapshot.
    Disk,
    /// Rebuilt from blob contents during this call.
    Built,
}

/// The session runtime. Cheap to clone via [`Arc`]; all state is interior.
pub struct Engine {
    config: ServerConfig,
    db: Database,
    blobs: BlobStore,
    index_store: IndexPersistence,
    tokenizer: Arc<dyn Tokenizer>,
    load_semaphore: Arc<Semaphore>,
    index_cache: Mutex<HashMap<String, Arc<Bm25Index>>>,
    session_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    /// Construct an engine rooted at the config's data directory: ensures
    /// the directory tree, opens the metadata store, and replays pending
    /// migrations.
    pub async fn new(config: ServerConfig) -> anyhow::Result<Self> {
        crate::config::ensure_directories(&config)?;

        let pool = crate::db::connect(&config.database_path()).await?;
        crate::migrate::run_migrations(&pool).await?;

        let tokenizer = crate::index::tokenizer::resolve(&config.tokenizer)
            .ok_or_else(|| anyhow::anyhow!("unknown tokenizer: {}", config.tokenizer))?;

        Ok(Self {
            blobs: BlobStore::new(config.blob_dir()),
            index_store: IndexPersistence::new(config.index_dir()),
            load_semaphore: Arc::new(Semaphore::new(config.max_concurrent_loads)),
            db: Database::new(pool),
            tokenizer,
            config,
            index_cache: Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn tokenizer(&self) -> &Arc<dyn Tokenizer> {
        &self.tokenizer
    }

    pub fn load_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.load_semaphore)
    }

    // --- Session authentication ---

    /// Look up a session, failing closed when it is absent.
    pub async fn authenticate(&self, session_id: &str) -> Result<Session> {
        self.db
            .get_session(session_id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound {
                session_id: session_id.to_string(),
            })
    }

    /// Fetch a document and verify it belongs to the session.
    pub async fn document_in_session(&self, session_id: &str, doc_id: &str) -> Result<Document> {
        match self.db.get_document(doc_id).await? {
            Some(doc) if doc.session_id == session_id => Ok(doc),
            _ => Err(EngineError::DocumentNotFound {
                doc_id: doc_id.to_string(),
                session_id: session_id.to_string(),
            }),
        }
    }

    /// Read a document's full content from the blob store.
    pub fn document_content(&self, doc: &Document) -> Result<String> {
        let bytes = self
            .blobs
            .get(&doc.content_hash)?
            .ok_or_else(|| EngineError::BlobMissing {
                content_hash: doc.content_hash.clone(),
            })?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // --- Lock management ---

    /// Get or create the lock for a session.
    ///
    /// The lock-manager mutex is held only for the map operation, never
    /// across an await on the session lock itself.
    pub async fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.session_locks.lock().await;
        locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop a session's lock entry, preventing unbounded growth of the map.
    /// Called after `session.close` completes; the lock must not be held.
    pub async fn release_session_lock(&self, session_id: &str) {
        let mut locks = self.session_locks.lock().await;
        locks.remove(session_id);
    }

    // --- Index cache ---

    /// Three-tier index retrieval, serialized per session.
    ///
    /// Two concurrent searches on the same session observe the same index:
    /// whichever arrives first builds it; the other waits on the session
    /// lock and then hits the cache.
    pub async fn get_or_build_index(&self, session_id: &str) -> Result<(Arc<Bm25Index>, IndexTier)> {
        let lock = self.session_lock(session_id).await;
        let _guard = lock.lock().await;

        // 1. In-memory cache.
        {
            let cache = self.index_cache.lock().await;
            if let Some(index) = cache.get(session_id) {
                tracing::debug!(session_id, "index cache hit (memory)");
                return Ok((Arc::clone(index), IndexTier::Memory));
            }
        }

        // 2. On-disk snapshot, validated against the live document set.
        if let Some((index, metadata)) = self.index_store.load(session_id) {
            let doc_count = self.db.count_documents(session_id).await?;
            let pairs = self.db.get_document_fingerprints(session_id).await?;
            let fingerprint = compute_doc_fingerprint(&pairs);

            if !metadata.is_stale(doc_count, &fingerprint, self.tokenizer.name()) {
                tracing::info!(session_id, doc_count, "index cache hit (disk)");
                let index = Arc::new(index);
                self.index_cache
                    .lock()
                    .await
                    .insert(session_id.to_string(), Arc::clone(&index));
                return Ok((index, IndexTier::Disk));
            }

            tracing::info!(session_id, "index snapshot stale, rebuilding");
            self.index_store.invalidate(session_id);
        }

        // 3. Rebuild from blob contents.
        let index = Arc::new(self.build_index(session_id).await?);
        self.index_cache
            .lock()
            .await
            .insert(session_id.to_string(), Arc::clone(&index));
        Ok((index, IndexTier::Built))
    }

    async fn build_index(&self, session_id: &str) -> Result<Bm25Index> {
        let total = self.db.count_documents(session_id).await?;
        if total > INDEX_BUILD_LIMIT {
            tracing::warn!(
                session_id,
                total,
                limit = INDEX_BUILD_LIMIT,
                "document count exceeds index build limit; indexing the first {INDEX_BUILD_LIMIT} only"
            );
        }
        let documents = self
            .db
            .list_documents(session_id, INDEX_BUILD_LIMIT, 0)
            .await?;

        let mut corpus: Vec<(String, Vec<String>)> = Vec::with_capacity(documents.len());
        for doc in &documents {
            let bytes = match self.blobs.get(&doc.content_hash)? {
                Some(bytes) => bytes,
                None => {
                    tracing::warn!(
                        session_id,
                        doc_id = %doc.id,
                        content_hash = %doc.content_hash,
                        "blob unreachable, document skipped from index"
                    );
                    continue;
                }
            };
            let mut content = String::from_utf8_lossy(&bytes).into_owned();
            if content.len() > INDEX_DOC_CHAR_CAP {
                tracing::warn!(
                    session_id,
                    doc_id = %doc.id,
                    document = %doc.display_name(),
                    cap = INDEX_DOC_CHAR_CAP,
                    "document truncated into index at character cap"
                );
                let mut cut = INDEX_DOC_CHAR_CAP;
                while !content.is_char_boundary(cut) {
                    cut -= 1;
                }
                content.truncate(cut);
            }
            corpus.push((doc.id.clone(), self.tokenizer.tokenize(&content)));
        }

        let index = Bm25Index::build(self.tokenizer.name(), corpus);
        tracing::info!(session_id, doc_count = index.doc_count(), "index built");
        Ok(index)
    }

    /// Drop the in-memory cache entry and delete the on-disk snapshot.
    ///
    /// Callers that need the invalidation to be consistent with concurrent
    /// searches (every mutation of the document set does) must hold the
    /// session lock across this call and their own commit.
    pub async fn invalidate_index(&self, session_id: &str) {
        self.index_cache.lock().await.remove(session_id);
        self.index_store.invalidate(session_id);
    }

    /// Close-time critical section: persist the cached index (if any), flip
    /// the session to completed, and evict the cache entry.
    ///
    /// Persisting happens before the status update, so an interrupted close
    /// either fully persists and closes or fails with the session still
    /// active and no half-written snapshot on disk.
    pub async fn close_session(&self, session_id: &str) -> Result<Session> {
        let lock = self.session_lock(session_id).await;
        let result = {
            let _guard = lock.lock().await;

            let session = self.authenticate(session_id).await?;
            if session.status != SessionStatus::Active {
                return Err(EngineError::SessionAlreadyClosed {
                    session_id: session_id.to_string(),
                });
            }

            let cached = {
                let cache = self.index_cache.lock().await;
                cache.get(session_id).cloned()
            };
            if let Some(index) = cached {
                let doc_count = self.db.count_documents(session_id).await?;
                let pairs = self.db.get_document_fingerprints(session_id).await?;
                let metadata = crate::index::persistence::IndexMetadata {
                    index_version: crate::index::bm25::INDEX_VERSION,
                    created_at: chrono::Utc::now(),
                    doc_count,
                    tokenizer: self.tokenizer.name().to_string(),
                    doc_fingerprint: compute_doc_fingerprint(&pairs),
                };
                self.index_store.save(session_id, &index, &metadata)?;
            }

            let closed_at = chrono::Utc::now();
            self.db
                .update_session_status(session_id, SessionStatus::Completed, Some(closed_at))
                .await?;
            self.index_cache.lock().await.remove(session_id);

            Session {
                status: SessionStatus::Completed,
                closed_at: Some(closed_at),
                ..session
            }
        };

        self.release_session_lock(session_id).await;
        Ok(result)
    }

    /// Whether the in-memory cache currently holds an index for the session.
    pub async fn index_cached(&self, session_id: &str) -> bool {
        self.index_cache.lock().await.contains_key(session_id)
    }
}

/// Truncate `content` to at most `max_chars` characters, reporting whether
/// anything was cut. Never splits a character.
pub fn truncate_chars(content: &str, max_chars: usize) -> (String, bool) {
    if content.chars().count() <= max_chars {
        return (content.to_string(), false);
    }
    (content.chars().take(max_chars).collect(), true)
}
