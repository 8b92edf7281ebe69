//! Artifact tools: `artifact.store`, `artifact.list`, `artifact.get`.
//!
//! Artifacts are the session's derived results — summaries, extractions,
//! classifications — each optionally attributed to a span. An inline span
//! reference creates the span on the fly with a `manual` strategy record, so
//! every artifact can cite the exact byte range it was produced from.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::blobs::hash_bytes;
use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::models::{
    generate_id, Artifact, ArtifactProvenance, ChunkStrategy, Span, SpanRef,
};
use crate::tools::{names, parse_params, ToolHandler};

#[derive(Debug, Deserialize)]
struct ArtifactStoreParams {
    session_id: String,
    r#type: String,
    content: Value,
    #[serde(default)]
    span_id: Option<String>,
    #[serde(default)]
    span: Option<SpanRef>,
    #[serde(default)]
    provenance: Option<ArtifactProvenance>,
}

/// `artifact.store` — persist a derived result with provenance.
pub struct ArtifactStore;

#[async_trait]
impl ToolHandler for ArtifactStore {
    fn name(&self) -> &'static str {
        names::ARTIFACT_STORE
    }

    fn description(&self) -> &'static str {
        "Store a derived artifact with provenance"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "type": { "type": "string", "description": "summary, extraction, classification, custom, …" },
                "content": { "type": "object" },
                "span_id": { "type": "string", "description": "Existing span to attribute" },
                "span": {
                    "type": "object",
                    "description": "Inline span reference; creates the span",
                    "properties": {
                        "doc_id": { "type": "string" },
                        "start": { "type": "integer" },
                        "end": { "type": "integer" }
                    },
                    "required": ["doc_id", "start", "end"]
                },
                "provenance": {
                    "type": "object",
                    "properties": {
                        "model": { "type": "string" },
                        "prompt_hash": { "type": "string" },
                        "tool": { "type": "string" }
                    }
                }
            },
            "required": ["session_id", "type", "content"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: ArtifactStoreParams = parse_params(params)?;

        let mut resolved_span_id = params.span_id.clone();

        // An inline span reference creates the span it describes.
        if let (Some(span_ref), None) = (&params.span, &params.span_id) {
            let doc = engine
                .document_in_session(&params.session_id, &span_ref.doc_id)
                .await?;

            if span_ref.start >= span_ref.end || span_ref.end > doc.length_chars {
                return Err(EngineError::invalid(
                    "span",
                    format!(
                        "range [{}, {}) is not within the document's {} chars",
                        span_ref.start, span_ref.end, doc.length_chars
                    ),
                ));
            }

            let bytes = engine
                .blobs()
                .get_slice(&doc.content_hash, span_ref.start, span_ref.end)?
                .ok_or_else(|| EngineError::BlobMissing {
                    content_hash: doc.content_hash.clone(),
                })?;

            let span = Span {
                id: generate_id(),
                document_id: doc.id.clone(),
                start_offset: span_ref.start,
                end_offset: span_ref.end,
                content_hash: hash_bytes(&bytes),
                strategy: ChunkStrategy::Manual,
                chunk_index: None,
                created_at: Utc::now(),
            };
            engine.db().create_span(&span).await?;
            resolved_span_id = Some(span.id);
        }

        // A caller-provided span id must exist and belong to this session.
        if let Some(span_id) = &params.span_id {
            let span = engine.db().get_span(span_id).await?.ok_or_else(|| {
                EngineError::SpanNotFound {
                    span_id: span_id.clone(),
                    session_id: params.session_id.clone(),
                    document_name: None,
                    chunk_index: None,
                }
            })?;
            engine
                .document_in_session(&params.session_id, &span.document_id)
                .await
                .map_err(|_| EngineError::SpanNotFound {
                    span_id: span_id.clone(),
                    session_id: params.session_id.clone(),
                    document_name: None,
                    chunk_index: span.chunk_index,
                })?;
        }

        let artifact = Artifact {
            id: generate_id(),
            session_id: params.session_id.clone(),
            span_id: resolved_span_id.clone(),
            r#type: params.r#type,
            content: params.content,
            provenance: params.provenance,
            created_at: Utc::now(),
        };
        engine.db().create_artifact(&artifact).await?;

        Ok(json!({
            "artifact_id": artifact.id,
            "span_id": resolved_span_id,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactListParams {
    session_id: String,
    #[serde(default)]
    span_id: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
}

/// `artifact.list` — artifact records with provenance, optionally filtered
/// by span or type.
pub struct ArtifactList;

#[async_trait]
impl ToolHandler for ArtifactList {
    fn name(&self) -> &'static str {
        names::ARTIFACT_LIST
    }

    fn description(&self) -> &'static str {
        "List artifacts for a session or span"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "span_id": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: ArtifactListParams = parse_params(params)?;
        let artifacts = engine
            .db()
            .list_artifacts(
                &params.session_id,
                params.span_id.as_deref(),
                params.r#type.as_deref(),
            )
            .await?;

        let records: Vec<Value> = artifacts
            .iter()
            .map(|a| {
                json!({
                    "artifact_id": a.id,
                    "span_id": a.span_id,
                    "type": a.r#type,
                    "created_at": a.created_at.to_rfc3339(),
                    "provenance": a.provenance,
                })
            })
            .collect();

        Ok(json!({ "artifacts": records }))
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactGetParams {
    session_id: String,
    artifact_id: String,
}

/// `artifact.get` — full artifact content with its resolved span reference.
pub struct ArtifactGet;

#[async_trait]
impl ToolHandler for ArtifactGet {
    fn name(&self) -> &'static str {
        names::ARTIFACT_GET
    }

    fn description(&self) -> &'static str {
        "Retrieve artifact content"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "artifact_id": { "type": "string" }
            },
            "required": ["session_id", "artifact_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: ArtifactGetParams = parse_params(params)?;

        let artifact = engine
            .db()
            .get_artifact(&params.artifact_id)
            .await?
            .filter(|a| a.session_id == params.session_id)
            .ok_or_else(|| EngineError::ArtifactNotFound {
                artifact_id: params.artifact_id.clone(),
                session_id: params.session_id.clone(),
            })?;

        let span_ref = match &artifact.span_id {
            Some(span_id) => engine.db().get_span(span_id).await?.map(|s| s.to_ref()),
            None => None,
        };

        Ok(json!({
            "artifact_id": artifact.id,
            "span_id": artifact.span_id,
            "span": span_ref,
            "type": artifact.r#type,
            "content": artifact.content,
            "provenance": artifact.provenance,
            "created_at": artifact.created_at.to_rfc3339(),
        }))
    }
}
