//! Metadata store: sessions, documents, spans, artifacts, and traces.
//!
//! Wraps the SQLite pool and translates every operation into one or more SQL
//! statements. Entities cross this boundary as the model types from
//! [`crate::models`]; JSON columns (config, source, strategy, provenance,
//! summaries) round-trip through `serde_json`.
//!
//! The one operation with special concurrency requirements is
//! [`Database::try_increment_tool_calls`]: the budget charge is a single
//! `UPDATE … WHERE … RETURNING` statement so that concurrent calls at the
//! cap boundary are linearized by the database itself.

use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::errors::{EngineError, Result};
use crate::models::{
    Artifact, ArtifactProvenance, ChunkStrategy, Document, DocumentSource, Session, SessionConfig,
    SessionStatus, Span, TraceEntry,
};

/// Outcome of an atomic budget charge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charge {
    /// The increment was applied; carries the new count.
    Allowed(i64),
    /// The cap would have been exceeded; nothing was incremented.
    Denied { used: i64, limit: i64 },
}

/// SQLite-backed metadata store.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // --- Session operations ---

    pub async fn create_session(&self, session: &Session) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, status, config, max_tool_calls,
                                  tool_calls_used, created_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.name)
        .bind(session.status.as_str())
        .bind(to_json(&session.config))
        .bind(session.config.max_tool_calls)
        .bind(session.tool_calls_used)
        .bind(session.created_at.to_rfc3339())
        .bind(session.closed_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await
        .map_err(EngineError::Storage)?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_session).transpose()
    }

    /// Perform the `active → completed` transition.
    pub async fn update_session_status(
        &self,
        session_id: &str,
        status: SessionStatus,
        closed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, closed_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(closed_at.map(|t| t.to_rfc3339()))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Atomically charge one tool call against the session's budget.
    ///
    /// The cap lives in the statement's predicate, so N concurrent calls at
    /// the boundary produce exactly `cap − used` increments; the rest are
    /// denied without any change. Returns [`Charge::Denied`] with the current
    /// counters when the cap would be exceeded.
    pub async fn try_increment_tool_calls(&self, session_id: &str) -> Result<Charge> {
        let new_count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE sessions
            SET tool_calls_used = tool_calls_used + 1
            WHERE id = ? AND tool_calls_used < max_tool_calls
            RETURNING tool_calls_used
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        match new_count {
            Some(count) => Ok(Charge::Allowed(count)),
            None => {
                let session = self.get_session(session_id).await?.ok_or_else(|| {
                    EngineError::SessionNotFound {
                        session_id: session_id.to_string(),
                    }
                })?;
                Ok(Charge::Denied {
                    used: session.tool_calls_used,
                    limit: session.config.max_tool_calls,
                })
            }
        }
    }

    /// Aggregate character/token totals over a session's documents.
    pub async fn session_stats(&self, session_id: &str) -> Result<(i64, i64)> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(length_chars), 0) AS total_chars,
                   COALESCE(SUM(length_tokens_est), 0) AS total_tokens_est
            FROM documents WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get("total_chars"), row.get("total_tokens_est")))
    }

    // --- Document operations ---

    pub async fn create_document(&self, document: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        insert_document(&mut tx, document).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Insert a batch of documents in one transaction: either all rows
    /// commit or none do.
    pub async fn create_documents_batch(&self, documents: &[Document]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for document in documents {
            insert_document(&mut tx, document).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(doc_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_document).transpose()
    }

    pub async fn list_documents(
        &self,
        session_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT * FROM documents WHERE session_id = ? ORDER BY id LIMIT ? OFFSET ?",
        )
        .bind(session_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_document).collect()
    }

    pub async fn count_documents(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// `(id, content_hash)` pairs in ascending document-id order — the input
    /// of the index fingerprint.
    pub async fn get_document_fingerprints(
        &self,
        session_id: &str,
    ) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT id, content_hash FROM documents WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("id"), row.get("content_hash")))
            .collect())
    }

    // --- Span operations ---

    pub async fn create_span(&self, span: &Span) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO spans (id, document_id, start_offset, end_offset,
                               content_hash, strategy, chunk_index, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&span.id)
        .bind(&span.document_id)
        .bind(span.start_offset as i64)
        .bind(span.end_offset as i64)
        .bind(&span.content_hash)
        .bind(to_json(&span.strategy))
        .bind(span.chunk_index)
        .bind(span.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_span(&self, span_id: &str) -> Result<Option<Span>> {
        let row = sqlx::query("SELECT * FROM spans WHERE id = ? AND deleted = 0")
            .bind(span_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_span).transpose()
    }

    /// Fetch a tombstoned span so error paths can cite its document and
    /// chunk index without dereferencing it.
    pub async fn get_deleted_span(&self, span_id: &str) -> Result<Option<Span>> {
        let row = sqlx::query("SELECT * FROM spans WHERE id = ? AND deleted = 1")
            .bind(span_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_span).transpose()
    }

    pub async fn list_spans_by_document(&self, document_id: &str) -> Result<Vec<Span>> {
        let rows = sqlx::query(
            "SELECT * FROM spans WHERE document_id = ? AND deleted = 0 ORDER BY start_offset",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_span).collect()
    }

    pub async fn count_spans(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM spans s
            JOIN documents d ON s.document_id = d.id
            WHERE d.session_id = ? AND s.deleted = 0
            "#,
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn count_spans_for_document(&self, doc_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM spans WHERE document_id = ? AND deleted = 0")
                .bind(doc_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Test hook: tombstone a span. The engine itself never deletes spans.
    pub async fn mark_span_deleted(&self, span_id: &str) -> Result<()> {
        sqlx::query("UPDATE spans SET deleted = 1 WHERE id = ?")
            .bind(span_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Artifact operations ---

    pub async fn create_artifact(&self, artifact: &Artifact) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO artifacts (id, session_id, span_id, type, content, provenance, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&artifact.id)
        .bind(&artifact.session_id)
        .bind(&artifact.span_id)
        .bind(&artifact.r#type)
        .bind(artifact.content.to_string())
        .bind(artifact.provenance.as_ref().map(to_json))
        .bind(artifact.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<Option<Artifact>> {
        let row = sqlx::query("SELECT * FROM artifacts WHERE id = ?")
            .bind(artifact_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_artifact).transpose()
    }

    pub async fn list_artifacts(
        &self,
        session_id: &str,
        span_id: Option<&str>,
        artifact_type: Option<&str>,
    ) -> Result<Vec<Artifact>> {
        let mut query = String::from("SELECT * FROM artifacts WHERE session_id = ?");
        if span_id.is_some() {
            query.push_str(" AND span_id = ?");
        }
        if artifact_type.is_some() {
            query.push_str(" AND type = ?");
        }
        query.push_str(" ORDER BY created_at, id");

        let mut q = sqlx::query(&query).bind(session_id);
        if let Some(span_id) = span_id {
            q = q.bind(span_id);
        }
        if let Some(artifact_type) = artifact_type {
            q = q.bind(artifact_type);
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_artifact).collect()
    }

    pub async fn count_artifacts(&self, session_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM artifacts WHERE session_id = ?")
            .bind(session_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // --- Trace operations ---

    pub async fn append_trace(&self, trace: &TraceEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO traces (id, session_id, timestamp, operation, input_summary,
                                output_summary, duration_ms, success, correlation_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trace.id)
        .bind(&trace.session_id)
        .bind(trace.timestamp.to_rfc3339())
        .bind(&trace.operation)
        .bind(trace.input_summary.to_string())
        .bind(trace.output_summary.to_string())
        .bind(trace.duration_ms)
        .bind(trace.success as i64)
        .bind(&trace.correlation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_traces(&self, session_id: &str) -> Result<Vec<TraceEntry>> {
        let rows = sqlx::query("SELECT * FROM traces WHERE session_id = ? ORDER BY timestamp, id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_trace).collect()
    }
}

async fn insert_document(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document: &Document,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, session_id, content_hash, source, length_chars,
                               length_tokens_est, metadata, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&document.id)
    .bind(&document.session_id)
    .bind(&document.content_hash)
    .bind(to_json(&document.source))
    .bind(document.length_chars as i64)
    .bind(document.length_tokens_est)
    .bind(serde_json::Value::Object(document.metadata.clone()).to_string())
    .bind(document.created_at.to_rfc3339())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

// --- Row mapping ---

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string(value).expect("model types serialize to JSON")
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::invalid("timestamp", format!("bad stored timestamp: {e}")))
}

fn row_to_session(row: sqlx::sqlite::SqliteRow) -> Result<Session> {
    let config: SessionConfig = serde_json::from_str(&row.get::<String, _>("config"))
        .map_err(|e| EngineError::invalid("config", format!("bad stored session config: {e}")))?;
    let status_raw: String = row.get("status");
    let status = SessionStatus::parse(&status_raw)
        .ok_or_else(|| EngineError::invalid("status", format!("unknown status: {status_raw}")))?;
    Ok(Session {
        id: row.get("id"),
        name: row.get("name"),
        status,
        config,
        created_at: parse_timestamp(row.get("created_at"))?,
        closed_at: row
            .get::<Option<String>, _>("closed_at")
            .map(parse_timestamp)
            .transpose()?,
        tool_calls_used: row.get("tool_calls_used"),
    })
}

fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let source: DocumentSource = serde_json::from_str(&row.get::<String, _>("source"))
        .map_err(|e| EngineError::invalid("source", format!("bad stored source: {e}")))?;
    let metadata = serde_json::from_str(&row.get::<String, _>("metadata")).unwrap_or_default();
    Ok(Document {
        id: row.get("id"),
        session_id: row.get("session_id"),
        content_hash: row.get("content_hash"),
        source,
        length_chars: row.get::<i64, _>("length_chars") as usize,
        length_tokens_est: row.get("length_tokens_est"),
        metadata,
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn row_to_span(row: sqlx::sqlite::SqliteRow) -> Result<Span> {
    let strategy: ChunkStrategy = serde_json::from_str(&row.get::<String, _>("strategy"))
        .map_err(|e| EngineError::invalid("strategy", format!("bad stored strategy: {e}")))?;
    Ok(Span {
        id: row.get("id"),
        document_id: row.get("document_id"),
        start_offset: row.get::<i64, _>("start_offset") as usize,
        end_offset: row.get::<i64, _>("end_offset") as usize,
        content_hash: row.get("content_hash"),
        strategy,
        chunk_index: row.get("chunk_index"),
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn row_to_artifact(row: sqlx::sqlite::SqliteRow) -> Result<Artifact> {
    let content = serde_json::from_str(&row.get::<String, _>("content"))
        .map_err(|e| EngineError::invalid("content", format!("bad stored content: {e}")))?;
    let provenance: Option<ArtifactProvenance> = row
        .get::<Option<String>, _>("provenance")
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| EngineError::invalid("provenance", format!("bad stored provenance: {e}")))?;
    Ok(Artifact {
        id: row.get("id"),
        session_id: row.get("session_id"),
        span_id: row.get("span_id"),
        r#type: row.get("type"),
        content,
        provenance,
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn row_to_trace(row: sqlx::sqlite::SqliteRow) -> Result<TraceEntry> {
    Ok(TraceEntry {
        id: row.get("id"),
        session_id: row.get("session_id"),
        timestamp: parse_timestamp(row.get("timestamp"))?,
        operation: row.get("operation"),
        input_summary: serde_json::from_str(&row.get::<String, _>("input_summary"))
            .unwrap_or(serde_json::Value::Null),
        output_summary: serde_json::from_str(&row.get::<String, _>("output_summary"))
            .unwrap_or(serde_json::Value::Null),
        duration_ms: row.get("duration_ms"),
        success: row.get::<i64, _>("success") != 0,
        correlation_id: row.get("correlation_id"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::generate_id;

    async fn test_db() -> (tempfile::TempDir, Database) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("corpus.db"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        (tmp, Database::new(pool))
    }

    fn make_session(max_tool_calls: i64) -> Session {
        Session::new(
            Some("test".to_string()),
            SessionConfig {
                max_tool_calls,
                ..Default::default()
            },
        )
    }

    fn make_document(session_id: &str) -> Document {
        Document {
            id: generate_id(),
            session_id: session_id.to_string(),
            content_hash: "ab".repeat(32),
            source: DocumentSource::Inline,
            length_chars: 12,
            length_tokens_est: 3,
            metadata: Default::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_session_roundtrip() {
        let (_tmp, db) = test_db().await;
        let session = make_session(10);
        db.create_session(&session).await.unwrap();

        let loaded = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.status, SessionStatus::Active);
        assert_eq!(loaded.config.max_tool_calls, 10);
        assert_eq!(loaded.tool_calls_used, 0);
    }

    #[tokio::test]
    async fn test_charge_increments_until_cap() {
        let (_tmp, db) = test_db().await;
        let session = make_session(3);
        db.create_session(&session).await.unwrap();

        assert_eq!(
            db.try_increment_tool_calls(&session.id).await.unwrap(),
            Charge::Allowed(1)
        );
        assert_eq!(
            db.try_increment_tool_calls(&session.id).await.unwrap(),
            Charge::Allowed(2)
        );
        assert_eq!(
            db.try_increment_tool_calls(&session.id).await.unwrap(),
            Charge::Allowed(3)
        );
        assert_eq!(
            db.try_increment_tool_calls(&session.id).await.unwrap(),
            Charge::Denied { used: 3, limit: 3 }
        );
        // Denial did not increment.
        let session = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.tool_calls_used, 3);
    }

    #[tokio::test]
    async fn test_charge_missing_session() {
        let (_tmp, db) = test_db().await;
        let err = db.try_increment_tool_calls("no-such").await.unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_concurrent_charges_at_cap_boundary() {
        let (_tmp, db) = test_db().await;
        let session = make_session(5);
        db.create_session(&session).await.unwrap();

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let db = db.clone();
            let id = session.id.clone();
            set.spawn(async move { db.try_increment_tool_calls(&id).await.unwrap() });
        }

        let mut allowed = Vec::new();
        let mut denied = 0;
        while let Some(result) = set.join_next().await {
            match result.unwrap() {
                Charge::Allowed(n) => allowed.push(n),
                Charge::Denied { .. } => denied += 1,
            }
        }

        allowed.sort_unstable();
        assert_eq!(allowed, vec![1, 2, 3, 4, 5]);
        assert_eq!(denied, 15);

        let session = db.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(session.tool_calls_used, 5);
    }

    #[tokio::test]
    async fn test_batch_insert_is_atomic() {
        let (_tmp, db) = test_db().await;
        let session = make_session(10);
        db.create_session(&session).await.unwrap();

        let doc_a = make_document(&session.id);
        let mut doc_b = make_document(&session.id);
        doc_b.id = doc_a.id.clone(); // primary key collision

        let err = db.create_documents_batch(&[doc_a, doc_b]).await;
        assert!(err.is_err());
        assert_eq!(db.count_documents(&session.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fingerprints_ordered_by_id() {
        let (_tmp, db) = test_db().await;
        let session = make_session(10);
        db.create_session(&session).await.unwrap();

        let mut docs = vec![
            make_document(&session.id),
            make_document(&session.id),
            make_document(&session.id),
        ];
        db.create_documents_batch(&docs).await.unwrap();

        docs.sort_by(|a, b| a.id.cmp(&b.id));
        let pairs = db.get_document_fingerprints(&session.id).await.unwrap();
        let expected: Vec<(String, String)> = docs
            .iter()
            .map(|d| (d.id.clone(), d.content_hash.clone()))
            .collect();
        assert_eq!(pairs, expected);
    }

    #[tokio::test]
    async fn test_span_tombstone_hides_but_preserves() {
        let (_tmp, db) = test_db().await;
        let session = make_session(10);
        db.create_session(&session).await.unwrap();
        let doc = make_document(&session.id);
        db.create_document(&doc).await.unwrap();

        let span = Span {
            id: generate_id(),
            document_id: doc.id.clone(),
            start_offset: 0,
            end_offset: 4,
            content_hash: "cd".repeat(32),
            strategy: ChunkStrategy::Manual,
            chunk_index: Some(2),
            created_at: Utc::now(),
        };
        db.create_span(&span).await.unwrap();
        assert!(db.get_span(&span.id).await.unwrap().is_some());

        db.mark_span_deleted(&span.id).await.unwrap();
        assert!(db.get_span(&span.id).await.unwrap().is_none());

        let tombstone = db.get_deleted_span(&span.id).await.unwrap().unwrap();
        assert_eq!(tombstone.chunk_index, Some(2));
        assert_eq!(tombstone.document_id, doc.id);
    }

    #[tokio::test]
    async fn test_artifact_filters() {
        let (_tmp, db) = test_db().await;
        let session = make_session(10);
        db.create_session(&session).await.unwrap();

        for artifact_type in ["summary", "summary", "extraction"] {
            let artifact = Artifact {
                id: generate_id(),
                session_id: session.id.clone(),
                span_id: None,
                r#type: artifact_type.to_string(),
                content: serde_json::json!({"text": "x"}),
                provenance: None,
                created_at: Utc::now(),
            };
            db.create_artifact(&artifact).await.unwrap();
        }

        let all = db.list_artifacts(&session.id, None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        let summaries = db
            .list_artifacts(&session.id, None, Some("summary"))
            .await
            .unwrap();
        assert_eq!(summaries.len(), 2);
    }
}
