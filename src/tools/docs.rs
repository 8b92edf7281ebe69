//! Document tools: `docs.load`, `docs.list`, `docs.peek`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::blobs::hash_bytes;
use crate::engine::{truncate_chars, Engine};
use crate::errors::{EngineError, Result};
use crate::loader::{load_sources, SourceSpec};
use crate::models::LoadedDocument;
use crate::tools::{names, parse_params, ToolHandler};

#[derive(Debug, Deserialize)]
struct DocsLoadParams {
    session_id: String,
    sources: Vec<SourceSpec>,
}

/// `docs.load` — ingest sources into the session.
///
/// Loads run concurrently under the engine's load semaphore; successful rows
/// commit in a single batch insert. The commit and the invalidation of the
/// session's index caches happen under the session lock, so a concurrent
/// search can never cache an index that misses the new documents.
pub struct DocsLoad;

#[async_trait]
impl ToolHandler for DocsLoad {
    fn name(&self) -> &'static str {
        names::DOCS_LOAD
    }

    fn description(&self) -> &'static str {
        "Load documents into the session context"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "sources": {
                    "type": "array",
                    "description": "Source specs: inline, file, directory, or glob",
                    "items": {
                        "type": "object",
                        "properties": {
                            "type": { "type": "string", "enum": ["inline", "file", "directory", "glob"] },
                            "content": { "type": "string" },
                            "path": { "type": "string" },
                            "pattern": { "type": "string" },
                            "recursive": { "type": "boolean" },
                            "include_globs": { "type": "array", "items": { "type": "string" } },
                            "exclude_globs": { "type": "array", "items": { "type": "string" } },
                            "token_count_hint": { "type": "integer" }
                        },
                        "required": ["type"]
                    }
                }
            },
            "required": ["session_id", "sources"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: DocsLoadParams = parse_params(params)?;
        let session_id = params.session_id;

        let outcome = load_sources(
            engine.blobs(),
            engine.load_semaphore(),
            &session_id,
            &params.sources,
            engine.config().max_file_size_mb,
        )
        .await;

        if !outcome.documents.is_empty() {
            // Invalidation and commit share the session lock: the cache drop
            // is visible before the batch insert is acknowledged.
            let lock = engine.session_lock(&session_id).await;
            let _guard = lock.lock().await;
            engine.invalidate_index(&session_id).await;
            engine.db().create_documents_batch(&outcome.documents).await?;
        }

        let mut total_chars = 0usize;
        let mut total_tokens_est = 0i64;
        let loaded: Vec<LoadedDocument> = outcome
            .documents
            .iter()
            .map(|doc| {
                total_chars += doc.length_chars;
                total_tokens_est += doc.length_tokens_est;
                LoadedDocument {
                    doc_id: doc.id.clone(),
                    content_hash: doc.content_hash.clone(),
                    source: doc.source.display(),
                    length_chars: doc.length_chars,
                    length_tokens_est: doc.length_tokens_est,
                }
            })
            .collect();

        Ok(json!({
            "loaded": loaded,
            "errors": outcome.errors,
            "total_chars": total_chars,
            "total_tokens_est": total_tokens_est,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct DocsListParams {
    session_id: String,
    #[serde(default = "default_list_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_list_limit() -> i64 {
    100
}

/// `docs.list` — paginated document listing.
pub struct DocsList;

#[async_trait]
impl ToolHandler for DocsList {
    fn name(&self) -> &'static str {
        names::DOCS_LIST
    }

    fn description(&self) -> &'static str {
        "List documents in the session"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "limit": { "type": "integer", "default": 100 },
                "offset": { "type": "integer", "default": 0 }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: DocsListParams = parse_params(params)?;
        if params.limit < 1 {
            return Err(EngineError::invalid("limit", "must be >= 1"));
        }
        if params.offset < 0 {
            return Err(EngineError::invalid("offset", "must be >= 0"));
        }

        let db = engine.db();
        // Over-fetch by one to detect a further page.
        let mut docs = db
            .list_documents(&params.session_id, params.limit.saturating_add(1), params.offset)
            .await?;
        let has_more = docs.len() as i64 > params.limit;
        docs.truncate(params.limit as usize);

        let total = db.count_documents(&params.session_id).await?;

        let mut documents = Vec::with_capacity(docs.len());
        for doc in &docs {
            let span_count = db.count_spans_for_document(&doc.id).await?;
            documents.push(json!({
                "doc_id": doc.id,
                "content_hash": doc.content_hash,
                "source": doc.source.display(),
                "length_chars": doc.length_chars,
                "length_tokens_est": doc.length_tokens_est,
                "span_count": span_count,
            }));
        }

        Ok(json!({
            "documents": documents,
            "total": total,
            "has_more": has_more,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct DocsPeekParams {
    session_id: String,
    doc_id: String,
    #[serde(default)]
    start: i64,
    /// Exclusive end offset; omitted or negative means end of document.
    #[serde(default = "default_peek_end")]
    end: i64,
}

fn default_peek_end() -> i64 {
    -1
}

/// `docs.peek` — view a byte range of a document, capped by
/// `max_chars_per_peek` on top of the session's response cap.
pub struct DocsPeek;

#[async_trait]
impl ToolHandler for DocsPeek {
    fn name(&self) -> &'static str {
        names::DOCS_PEEK
    }

    fn description(&self) -> &'static str {
        "View a portion of a document"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "doc_id": { "type": "string" },
                "start": { "type": "integer", "default": 0 },
                "end": { "type": "integer", "default": -1, "description": "Exclusive; -1 for end of document" }
            },
            "required": ["session_id", "doc_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: DocsPeekParams = parse_params(params)?;
        let session = engine.authenticate(&params.session_id).await?;
        let doc = engine
            .document_in_session(&params.session_id, &params.doc_id)
            .await?;

        if params.start < 0 {
            return Err(EngineError::invalid("start", "must be >= 0"));
        }
        let start = params.start as usize;
        let end = if params.end < 0 {
            doc.length_chars
        } else {
            params.end as usize
        };
        if end < start {
            return Err(EngineError::invalid("end", "must not be before start"));
        }

        let bytes = engine
            .blobs()
            .get_slice(&doc.content_hash, start, end)?
            .ok_or_else(|| EngineError::BlobMissing {
                content_hash: doc.content_hash.clone(),
            })?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let cap = session
            .config
            .max_chars_per_peek
            .min(session.config.max_chars_per_response);
        let (content, truncated) = truncate_chars(&content, cap);
        let actual_end = start + content.len();

        Ok(json!({
            "content": content,
            "span": { "doc_id": doc.id, "start": start, "end": actual_end },
            "content_hash": hash_bytes(content.as_bytes()),
            "truncated": truncated,
            "total_length": doc.length_chars,
        }))
    }
}
