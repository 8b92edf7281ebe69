//! Database schema migrations.
//!
//! Schema evolution is forward-only: migrations are numbered, replayed on
//! startup, and each advances the single version counter in `schema_version`.
//! A database at version N gets exactly the migrations with number > N, in
//! order, each inside its own transaction.
//!
//! # Schema
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  sessions    │──┐  │  documents   │──┐  │    spans     │
//! │              │  │  │              │  │  │              │
//! │ id (PK)      │  │  │ id (PK)      │  │  │ id (PK)      │
//! │ name         │  └──│ session_id   │  └──│ document_id  │
//! │ status       │     │ content_hash │     │ start_offset │
//! │ config       │     │ source       │     │ end_offset   │
//! │ max_tool_    │     │ length_chars │     │ content_hash │
//! │   calls      │     │ length_tok.. │     │ strategy     │
//! │ tool_calls_  │     │ metadata     │     │ chunk_index  │
//! │   used       │     │ created_at   │     │ deleted      │
//! │ created_at   │     └──────────────┘     │ created_at   │
//! │ closed_at    │                          └──────────────┘
//! └──────┬───────┘
//!        │          ┌──────────────┐     ┌──────────────┐
//!        ├──────────│  artifacts   │     │   traces     │
//!        │          │ id (PK)      │     │ id (PK)      │
//!        └──────────│ session_id   │─────│ session_id   │
//!                   │ span_id      │     │ operation    │
//!                   │ type         │     │ input_summary│
//!                   │ content      │     │ output_sum.. │
//!                   │ provenance   │     │ duration_ms  │
//!                   │ created_at   │     │ success      │
//!                   └──────────────┘     │ correlation..│
//!                                        └──────────────┘
//! ```
//!
//! `max_tool_calls` is denormalized out of the session's config JSON into its
//! own column so the budget charge can be a single atomic UPDATE with the cap
//! in its predicate.

use anyhow::Result;
use sqlx::SqlitePool;

/// Forward-only migrations; index + 1 is the schema version the entry
/// brings the database to.
const MIGRATIONS: &[&str] = &[
    // v1: initial schema
    r#"
    CREATE TABLE sessions (
        id TEXT PRIMARY KEY,
        name TEXT,
        status TEXT NOT NULL,
        config TEXT NOT NULL,
        max_tool_calls INTEGER NOT NULL,
        tool_calls_used INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        closed_at TEXT
    );

    CREATE TABLE documents (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        content_hash TEXT NOT NULL,
        source TEXT NOT NULL,
        length_chars INTEGER NOT NULL,
        length_tokens_est INTEGER NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_documents_session_id ON documents(session_id);

    CREATE TABLE spans (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id),
        start_offset INTEGER NOT NULL,
        end_offset INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        strategy TEXT NOT NULL,
        chunk_index INTEGER,
        deleted INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_spans_document_id ON spans(document_id);

    CREATE TABLE artifacts (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL REFERENCES sessions(id),
        span_id TEXT REFERENCES spans(id),
        type TEXT NOT NULL,
        content TEXT NOT NULL,
        provenance TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX idx_artifacts_session_id ON artifacts(session_id);

    CREATE TABLE traces (
        id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        operation TEXT NOT NULL,
        input_summary TEXT NOT NULL,
        output_summary TEXT NOT NULL,
        duration_ms INTEGER NOT NULL,
        success INTEGER NOT NULL,
        correlation_id TEXT NOT NULL
    );
    CREATE INDEX idx_traces_session_id ON traces(session_id);
    "#,
];

/// Replay pending migrations against the pool.
///
/// Safe to call on every startup: already-applied versions are skipped.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")
        .execute(pool)
        .await?;

    let current: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    let current = current.unwrap_or(0);

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = i as i64 + 1;
        if version <= current {
            continue;
        }

        let mut tx = pool.begin().await?;
        // sqlx executes a single statement per query; run the batch
        // statement by statement.
        for statement in migration.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(version, "applied schema migration");
    }

    Ok(())
}

/// Current schema version, or 0 for a fresh database.
pub async fn schema_version(pool: &SqlitePool) -> Result<i64> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
    )
    .fetch_one(pool)
    .await?;
    if !exists {
        return Ok(0);
    }
    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
        .fetch_one(pool)
        .await?;
    Ok(version.unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> (tempfile::TempDir, SqlitePool) {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect(&tmp.path().join("corpus.db"))
            .await
            .unwrap();
        (tmp, pool)
    }

    #[tokio::test]
    async fn test_migrations_apply_and_are_idempotent() {
        let (_tmp, pool) = test_pool().await;

        run_migrations(&pool).await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), 1);

        // Re-running must not fail or advance the version.
        run_migrations(&pool).await.unwrap();
        assert_eq!(schema_version(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_tables_exist_after_migration() {
        let (_tmp, pool) = test_pool().await;
        run_migrations(&pool).await.unwrap();

        for table in ["sessions", "documents", "spans", "artifacts", "traces"] {
            let exists: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name = ?",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(exists, "missing table: {table}");
        }
    }
}
