//! Chunking and span tools: `chunk.create`, `span.get`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::blobs::hash_bytes;
use crate::chunk::Chunker;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::models::{generate_id, ChunkStrategy, Span};
use crate::tools::{names, parse_params, ToolHandler};

const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct ChunkCreateParams {
    session_id: String,
    doc_id: String,
    strategy: ChunkStrategy,
}

/// `chunk.create` — chunk a document and persist the resulting spans.
///
/// Deterministic: identical inputs yield identical ranges and content
/// hashes. When `chunk_cache_enabled` is set and spans from an equivalent
/// strategy already exist for the document, those spans are returned without
/// writing new rows; earlier spans are never invalidated or renumbered.
pub struct ChunkCreate;

#[async_trait]
impl ToolHandler for ChunkCreate {
    fn name(&self) -> &'static str {
        names::CHUNK_CREATE
    }

    fn description(&self) -> &'static str {
        "Chunk a document using a specified strategy"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "doc_id": { "type": "string" },
                "strategy": {
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["fixed", "lines", "delimiter"] },
                        "chunk_size": { "type": "integer" },
                        "line_count": { "type": "integer" },
                        "delimiter": { "type": "string" },
                        "overlap": { "type": "integer", "default": 0 },
                        "max_chunks": { "type": "integer" }
                    },
                    "required": ["type"]
                }
            },
            "required": ["session_id", "doc_id", "strategy"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: ChunkCreateParams = parse_params(params)?;
        let session = engine.authenticate(&params.session_id).await?;
        let doc = engine
            .document_in_session(&params.session_id, &params.doc_id)
            .await?;

        // Validate before touching content, so bad parameters never cost a
        // blob read.
        let chunker = Chunker::from_strategy(&params.strategy)?;

        // Short-circuit identical requests when the cache is enabled.
        if session.config.chunk_cache_enabled {
            let existing = engine.db().list_spans_by_document(&doc.id).await?;
            let mut same_strategy: Vec<&Span> = existing
                .iter()
                .filter(|s| s.strategy == params.strategy)
                .collect();
            if !same_strategy.is_empty() {
                same_strategy.sort_by_key(|s| s.chunk_index);
                let mut spans_output = Vec::with_capacity(same_strategy.len());
                for span in same_strategy {
                    spans_output.push(span_record(engine, &doc.content_hash, span)?);
                }
                return Ok(json!({
                    "spans": spans_output,
                    "total_spans": spans_output.len(),
                    "cached": true,
                }));
            }
        }

        let content = engine.document_content(&doc)?;
        let ranges = chunker.chunk(&content);

        let mut spans_output = Vec::with_capacity(ranges.len());
        for (i, (start, end)) in ranges.iter().enumerate() {
            let slice = &content.as_bytes()[*start..*end];
            let span = Span {
                id: generate_id(),
                document_id: doc.id.clone(),
                start_offset: *start,
                end_offset: *end,
                content_hash: hash_bytes(slice),
                strategy: params.strategy.clone(),
                chunk_index: Some(i as i64),
                created_at: Utc::now(),
            };
            engine.db().create_span(&span).await?;
            spans_output.push(span_record(engine, &doc.content_hash, &span)?);
        }

        Ok(json!({
            "spans": spans_output,
            "total_spans": spans_output.len(),
            "cached": false,
        }))
    }
}

fn span_record(engine: &Engine, doc_content_hash: &str, span: &Span) -> Result<Value> {
    let preview = engine
        .blobs()
        .get_slice(
            doc_content_hash,
            span.start_offset,
            (span.start_offset + PREVIEW_CHARS).min(span.end_offset),
        )?
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default();

    Ok(json!({
        "span_id": span.id,
        "index": span.chunk_index,
        "span": span.to_ref(),
        "length_chars": span.end_offset - span.start_offset,
        "content_hash": span.content_hash,
        "preview": preview,
    }))
}

#[derive(Debug, Deserialize)]
struct SpanGetParams {
    session_id: String,
    span_ids: Vec<String>,
}

/// `span.get` — retrieve span contents with provenance, under the session's
/// cumulative response cap.
pub struct SpanGet;

#[async_trait]
impl ToolHandler for SpanGet {
    fn name(&self) -> &'static str {
        names::SPAN_GET
    }

    fn description(&self) -> &'static str {
        "Retrieve the content of one or more spans"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "span_ids": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["session_id", "span_ids"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: SpanGetParams = parse_params(params)?;
        let session = engine.authenticate(&params.session_id).await?;

        let max_chars = session.config.max_chars_per_response;
        let mut total_chars = 0usize;
        let mut spans_output = Vec::new();

        for span_id in &params.span_ids {
            let span = match engine.db().get_span(span_id).await? {
                Some(span) => span,
                None => return Err(span_not_found(engine, span_id, &params.session_id).await?),
            };

            let doc = match engine.db().get_document(&span.document_id).await? {
                Some(doc) if doc.session_id == params.session_id => doc,
                _ => {
                    return Err(EngineError::SpanNotFound {
                        span_id: span_id.clone(),
                        session_id: params.session_id.clone(),
                        document_name: None,
                        chunk_index: span.chunk_index,
                    })
                }
            };

            let bytes = engine
                .blobs()
                .get_slice(&doc.content_hash, span.start_offset, span.end_offset)?
                .ok_or_else(|| EngineError::BlobMissing {
                    content_hash: doc.content_hash.clone(),
                })?;
            let content = String::from_utf8_lossy(&bytes).into_owned();

            let remaining = max_chars - total_chars;
            let (content, truncated) = crate::engine::truncate_chars(&content, remaining);
            total_chars += content.chars().count();

            spans_output.push(json!({
                "span_id": span.id,
                "span": span.to_ref(),
                "content": content,
                "content_hash": span.content_hash,
                "truncated": truncated,
            }));

            if total_chars >= max_chars {
                break;
            }
        }

        Ok(json!({
            "spans": spans_output,
            "total_chars_returned": total_chars,
        }))
    }
}

/// Build the richest `SpanNotFound` the store allows: a tombstoned span
/// still yields its owning document's name and its chunk index, without the
/// span ever being dereferenced.
async fn span_not_found(
    engine: &Engine,
    span_id: &str,
    session_id: &str,
) -> Result<EngineError> {
    if let Some(tombstone) = engine.db().get_deleted_span(span_id).await? {
        let document_name = engine
            .db()
            .get_document(&tombstone.document_id)
            .await?
            .filter(|doc| doc.session_id == session_id)
            .map(|doc| doc.display_name());
        return Ok(EngineError::SpanNotFound {
            span_id: span_id.to_string(),
            session_id: session_id.to_string(),
            document_name,
            chunk_index: tombstone.chunk_index,
        });
    }

    Ok(EngineError::SpanNotFound {
        span_id: span_id.to_string(),
        session_id: session_id.to_string(),
        document_name: None,
        chunk_index: None,
    })
}
