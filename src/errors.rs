//! Engine error types.
//!
//! The error set is closed: every failure a tool call can surface is one of
//! the variants below, each carrying enough context for the caller to correct
//! the call. Recoverable disk conditions (missing, unreadable, or corrupt
//! index snapshots) never appear here; they are handled locally by
//! invalidation and rebuild.

use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Session lookup failed.
    #[error("Session '{session_id}' not found. It may have been closed or never existed.")]
    SessionNotFound { session_id: String },

    /// Mutating operation against a completed session.
    #[error("Session '{session_id}' is closed; only session.info is allowed.")]
    SessionClosed { session_id: String },

    /// `session.close` against a session that already completed.
    #[error("Session '{session_id}' is already closed.")]
    SessionAlreadyClosed { session_id: String },

    /// Document lookup failed.
    #[error("Document '{doc_id}' not found in session '{session_id}'.")]
    DocumentNotFound { doc_id: String, session_id: String },

    /// Span lookup failed. Carries the owning document's display name and
    /// the span's chunk index when they can be recovered.
    #[error("{}", span_not_found_message(.span_id, .session_id, .document_name, .chunk_index))]
    SpanNotFound {
        span_id: String,
        session_id: String,
        document_name: Option<String>,
        chunk_index: Option<i64>,
    },

    /// Artifact lookup failed.
    #[error("Artifact '{artifact_id}' not found in session '{session_id}'.")]
    ArtifactNotFound {
        artifact_id: String,
        session_id: String,
    },

    /// Caller-fixable argument problem; `field` names the offending input.
    #[error("Invalid argument '{field}': {message}")]
    InvalidArgument { field: String, message: String },

    /// Atomic budget charge denied. No side effect occurred.
    #[error(
        "Tool call budget exceeded: {used}/{limit} calls used. \
         Close this session or create a new one with a higher max_tool_calls."
    )]
    BudgetExceeded {
        session_id: String,
        used: i64,
        limit: i64,
    },

    /// Blob store reported absence for a referenced hash.
    #[error("Content '{content_hash}' not found in blob store. The blob store may be corrupted.")]
    BlobMissing { content_hash: String },

    /// Blob bytes failed their own hash check.
    #[error("Content '{content_hash}' failed verification: stored bytes do not match their hash.")]
    BlobCorrupt { content_hash: String },

    /// Startup-only: the transport cannot register a canonical tool name
    /// verbatim and noncanonical fallbacks are disabled.
    #[error(
        "Cannot register tool '{name}' with its canonical name. \
         Set allow_noncanonical_tool_names = true to fall back to fabricated names."
    )]
    ToolNamingFailure { name: String },

    /// Metadata store failure of last resort.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Filesystem failure of last resort.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn span_not_found_message(
    span_id: &str,
    session_id: &str,
    document_name: &Option<String>,
    chunk_index: &Option<i64>,
) -> String {
    let mut msg = match (chunk_index, document_name) {
        (Some(index), Some(doc)) => format!("Chunk #{index} from document '{doc}' not found"),
        (None, Some(doc)) => format!("Chunk from document '{doc}' not found"),
        _ => format!("Chunk '{span_id}' not found"),
    };
    msg.push_str(&format!(
        " in session '{session_id}'. It may have been deleted or never created."
    ));
    msg
}

impl EngineError {
    /// Machine-readable kind tag for the error record returned to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SessionNotFound { .. } => "session_not_found",
            EngineError::SessionClosed { .. } => "session_closed",
            EngineError::SessionAlreadyClosed { .. } => "session_already_closed",
            EngineError::DocumentNotFound { .. } => "document_not_found",
            EngineError::SpanNotFound { .. } => "span_not_found",
            EngineError::ArtifactNotFound { .. } => "artifact_not_found",
            EngineError::InvalidArgument { .. } => "invalid_argument",
            EngineError::BudgetExceeded { .. } => "budget_exceeded",
            EngineError::BlobMissing { .. } => "blob_missing",
            EngineError::BlobCorrupt { .. } => "blob_corrupt",
            EngineError::ToolNamingFailure { .. } => "tool_naming_failure",
            EngineError::Storage(_) => "storage",
            EngineError::Io(_) => "io",
        }
    }

    /// Shorthand for [`EngineError::InvalidArgument`].
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::InvalidArgument {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Per-source failure inside a `docs.load` batch. These are aggregated into
/// the tool's error list instead of aborting the batch.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("File too large: {path} is {size_mb:.1} MB (limit {limit_mb} MB)")]
    FileTooLarge {
        path: String,
        size_mb: f64,
        limit_mb: u64,
    },

    #[error("Cannot decode {path} as UTF-8 text")]
    DecodeError { path: String },

    #[error("Invalid source spec: {message}")]
    InvalidSpec { message: String },

    #[error("Error loading {path}: {message}")]
    Io { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_not_found_with_chunk_index() {
        let err = EngineError::SpanNotFound {
            span_id: "abc".into(),
            session_id: "s1".into(),
            document_name: Some("report.txt".into()),
            chunk_index: Some(2),
        };
        let msg = err.to_string();
        assert!(msg.contains("Chunk #2"));
        assert!(msg.contains("report.txt"));
        assert!(msg.contains("s1"));
    }

    #[test]
    fn test_span_not_found_bare() {
        let err = EngineError::SpanNotFound {
            span_id: "abc".into(),
            session_id: "s1".into(),
            document_name: None,
            chunk_index: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Chunk 'abc'"));
        assert!(msg.contains("deleted or never created"));
    }

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(
            EngineError::BudgetExceeded {
                session_id: "s".into(),
                used: 3,
                limit: 3
            }
            .kind(),
            "budget_exceeded"
        );
        assert_eq!(
            EngineError::invalid("overlap", "must be smaller than chunk_size").kind(),
            "invalid_argument"
        );
    }
}
