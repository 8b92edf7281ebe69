//! Core data models used throughout corpus-harness.
//!
//! These types represent the sessions, documents, spans, and artifacts that
//! flow through the engine. The data lifecycle is:
//!
//! ```text
//! docs.load → Document ──▶ chunk.create → Span ──▶ artifact.store → Artifact
//!                 │                                        │
//!                 └──▶ search.query → SearchMatch ◀────────┘
//! ```
//!
//! # Identifier semantics
//!
//! - `doc_id` — session-scoped stable identifier (UUID v4)
//! - `content_hash` — global content-addressed blob store key (SHA-256 hex)
//! - `span_id` — session-scoped stable identifier for provenance
//!
//! The same bytes loaded into two sessions share one blob but receive
//! distinct document identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Generate a new UUID string.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Vendor-neutral token estimation.
///
/// Character count is ground truth; a client-provided hint wins when present.
/// Otherwise the `~4 chars/token` heuristic applies, rounded up.
pub fn estimate_tokens(chars: usize, hint: Option<i64>) -> i64 {
    match hint {
        Some(h) => h,
        None => (chars as i64 + 3) / 4,
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            _ => None,
        }
    }
}

/// Advisory metadata for client subcall decisions. The engine stores it and
/// passes it through; it never acts on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelHints {
    #[serde(default)]
    pub root_model: Option<String>,
    #[serde(default)]
    pub subcall_model: Option<String>,
    #[serde(default)]
    pub bulk_model: Option<String>,
}

/// Session configuration with denial-of-service protection caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Hard cap on `tool_calls_used`; charging past it denies the call.
    #[serde(default = "default_max_tool_calls")]
    pub max_tool_calls: i64,
    /// Total characters of user-visible content in any single response.
    #[serde(default = "default_max_chars_per_response")]
    pub max_chars_per_response: usize,
    /// Additional cap specific to `docs.peek`.
    #[serde(default = "default_max_chars_per_peek")]
    pub max_chars_per_peek: usize,
    /// Allow `chunk.create` to short-circuit identical chunk requests.
    #[serde(default = "default_chunk_cache_enabled")]
    pub chunk_cache_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_hints: Option<ModelHints>,
}

fn default_max_tool_calls() -> i64 {
    500
}
fn default_max_chars_per_response() -> usize {
    50_000
}
fn default_max_chars_per_peek() -> usize {
    10_000
}
fn default_chunk_cache_enabled() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_tool_calls: default_max_tool_calls(),
            max_chars_per_response: default_max_chars_per_response(),
            max_chars_per_peek: default_max_chars_per_peek(),
            chunk_cache_enabled: default_chunk_cache_enabled(),
            model_hints: None,
        }
    }
}

/// A session: lifecycle container for documents, spans, artifacts, traces,
/// and the tool-call budget counter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: Option<String>,
    pub status: SessionStatus,
    pub config: SessionConfig,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub tool_calls_used: i64,
}

impl Session {
    pub fn new(name: Option<String>, config: SessionConfig) -> Self {
        Self {
            id: generate_id(),
            name,
            status: SessionStatus::Active,
            config,
            created_at: Utc::now(),
            closed_at: None,
            tool_calls_used: 0,
        }
    }
}

/// Where a document's bytes came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DocumentSource {
    /// Content supplied inline with the tool call.
    Inline,
    /// A file read from the local filesystem.
    File { path: String },
}

impl DocumentSource {
    /// Short display form used in listings and error messages.
    pub fn display(&self) -> String {
        match self {
            DocumentSource::Inline => "inline".to_string(),
            DocumentSource::File { path } => path.clone(),
        }
    }
}

/// Document loaded into a session. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub session_id: String,
    /// Blob store address (SHA-256 hex); shared across sessions for
    /// identical bytes.
    pub content_hash: String,
    pub source: DocumentSource,
    pub length_chars: usize,
    pub length_tokens_est: i64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Human-readable name for error messages: the `filename` metadata entry
    /// when present, then the source path, then the document id.
    pub fn display_name(&self) -> String {
        if let Some(Value::String(name)) = self.metadata.get("filename") {
            return name.clone();
        }
        match &self.source {
            DocumentSource::Inline => self.id.clone(),
            DocumentSource::File { path } => path.clone(),
        }
    }
}

/// Chunking strategy record, persisted alongside every span it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkStrategy {
    /// Fixed-size character windows with optional overlap.
    Fixed {
        chunk_size: usize,
        #[serde(default)]
        overlap: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chunks: Option<usize>,
    },
    /// Windows of whole lines with optional line overlap.
    Lines {
        line_count: usize,
        #[serde(default)]
        overlap: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chunks: Option<usize>,
    },
    /// Ranges between consecutive delimiter matches (regex). The range
    /// containing each delimiter belongs to the following chunk.
    Delimiter {
        delimiter: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_chunks: Option<usize>,
    },
    /// Span created directly (inline span in `artifact.store`), not by a
    /// chunking pass.
    Manual,
}

/// Span reference for provenance: a half-open byte range of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRef {
    pub doc_id: String,
    pub start: usize,
    pub end: usize,
}

/// Document span with provenance. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub document_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// SHA-256 of the range's bytes; rehashing the stored bytes must
    /// reproduce this value.
    pub content_hash: String,
    pub strategy: ChunkStrategy,
    /// 0-based position in the producing batch, when created by
    /// `chunk.create`.
    pub chunk_index: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Span {
    pub fn to_ref(&self) -> SpanRef {
        SpanRef {
            doc_id: self.document_id.clone(),
            start: self.start_offset,
            end: self.end_offset,
        }
    }
}

/// Provenance metadata for artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactProvenance {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_hash: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Derived artifact with provenance. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub session_id: String,
    /// Null for session-level artifacts.
    pub span_id: Option<String>,
    /// Free-form type tag: summary, extraction, classification, custom, …
    pub r#type: String,
    pub content: Value,
    pub provenance: Option<ArtifactProvenance>,
    pub created_at: DateTime<Utc>,
}

/// Append-only per-operation trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Canonical tool name, e.g. `search.query`.
    pub operation: String,
    /// Input summary: argument keys only, never full payloads.
    pub input_summary: Value,
    /// Output summary: result shape and counts, never full content.
    pub output_summary: Value,
    pub duration_ms: i64,
    pub success: bool,
    pub correlation_id: String,
}

// --- Tool output records ---

/// Per-source result from `docs.load`.
#[derive(Debug, Clone, Serialize)]
pub struct LoadedDocument {
    pub doc_id: String,
    pub content_hash: String,
    pub source: String,
    pub length_chars: usize,
    pub length_tokens_est: i64,
}

/// Summary returned on session close.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub documents: i64,
    pub spans: i64,
    pub artifacts: i64,
    pub tool_calls: i64,
}

/// A highlighted region within a search snippet. Half-open range over the
/// snippet's bytes; merged regions carry every term they cover.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Highlight {
    pub start: usize,
    pub end: usize,
    pub terms: Vec<String>,
}

/// A single search match with its provenance span.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub doc_id: String,
    pub span: SpanRef,
    /// Scores may be negative; matches are never filtered on that basis.
    pub score: f64,
    pub context: String,
    pub highlights: Vec<Highlight>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_heuristic() {
        assert_eq!(estimate_tokens(0, None), 0);
        assert_eq!(estimate_tokens(1, None), 1);
        assert_eq!(estimate_tokens(4, None), 1);
        assert_eq!(estimate_tokens(5, None), 2);
        assert_eq!(estimate_tokens(100, None), 25);
    }

    #[test]
    fn test_estimate_tokens_hint_wins() {
        assert_eq!(estimate_tokens(100, Some(42)), 42);
    }

    #[test]
    fn test_session_config_defaults() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_tool_calls, 500);
        assert_eq!(config.max_chars_per_response, 50_000);
        assert_eq!(config.max_chars_per_peek, 10_000);
        assert!(config.chunk_cache_enabled);
    }

    #[test]
    fn test_chunk_strategy_roundtrip() {
        let strategy = ChunkStrategy::Fixed {
            chunk_size: 1000,
            overlap: 100,
            max_chunks: None,
        };
        let json = serde_json::to_string(&strategy).unwrap();
        assert!(json.contains(r#""type":"fixed""#));
        let back: ChunkStrategy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, strategy);
    }

    #[test]
    fn test_document_display_name_prefers_filename() {
        let mut metadata = serde_json::Map::new();
        metadata.insert("filename".into(), Value::String("notes.md".into()));
        let doc = Document {
            id: generate_id(),
            session_id: generate_id(),
            content_hash: "00".repeat(32),
            source: DocumentSource::File {
                path: "/tmp/notes.md".into(),
            },
            length_chars: 10,
            length_tokens_est: 3,
            metadata,
            created_at: Utc::now(),
        };
        assert_eq!(doc.display_name(), "notes.md");
    }
}
