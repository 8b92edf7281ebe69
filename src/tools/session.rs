//! Session management tools: `session.create`, `session.info`,
//! `session.close`.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::models::{ModelHints, Session, SessionConfig, SessionSummary};
use crate::tools::{names, parse_params, ToolHandler};

#[derive(Debug, Deserialize, Default)]
struct SessionCreateParams {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    config: Option<SessionConfigOverrides>,
}

/// Per-session overrides of the server's default caps. Absent fields fall
/// back to the server config.
#[derive(Debug, Deserialize, Default)]
struct SessionConfigOverrides {
    #[serde(default)]
    max_tool_calls: Option<i64>,
    #[serde(default)]
    max_chars_per_response: Option<usize>,
    #[serde(default)]
    max_chars_per_peek: Option<usize>,
    #[serde(default)]
    chunk_cache_enabled: Option<bool>,
    #[serde(default)]
    model_hints: Option<ModelHints>,
}

impl SessionConfigOverrides {
    fn resolve(self, engine: &Engine) -> Result<SessionConfig> {
        let server = engine.config();
        let config = SessionConfig {
            max_tool_calls: self.max_tool_calls.unwrap_or(server.default_max_tool_calls),
            max_chars_per_response: self
                .max_chars_per_response
                .unwrap_or(server.default_max_chars_per_response),
            max_chars_per_peek: self
                .max_chars_per_peek
                .unwrap_or(server.default_max_chars_per_peek),
            chunk_cache_enabled: self.chunk_cache_enabled.unwrap_or(true),
            model_hints: self.model_hints,
        };

        if config.max_tool_calls < 1 {
            return Err(EngineError::invalid("max_tool_calls", "must be >= 1"));
        }
        if config.max_chars_per_response < 1000 {
            return Err(EngineError::invalid(
                "max_chars_per_response",
                "must be >= 1000",
            ));
        }
        if config.max_chars_per_peek < 100 {
            return Err(EngineError::invalid("max_chars_per_peek", "must be >= 100"));
        }
        Ok(config)
    }
}

/// `session.create` — open a new session for processing a large corpus.
pub struct SessionCreate;

#[async_trait]
impl ToolHandler for SessionCreate {
    fn name(&self) -> &'static str {
        names::SESSION_CREATE
    }

    fn description(&self) -> &'static str {
        "Create a new session for processing large contexts"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Human-readable session name" },
                "config": {
                    "type": "object",
                    "description": "Session config overrides",
                    "properties": {
                        "max_tool_calls": { "type": "integer", "minimum": 1 },
                        "max_chars_per_response": { "type": "integer", "minimum": 1000 },
                        "max_chars_per_peek": { "type": "integer", "minimum": 100 },
                        "chunk_cache_enabled": { "type": "boolean" },
                        "model_hints": { "type": "object" }
                    }
                }
            }
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: SessionCreateParams = parse_params(params)?;
        let config = params.config.unwrap_or_default().resolve(engine)?;
        let session = Session::new(params.name, config);

        engine.db().create_session(&session).await?;

        Ok(json!({
            "session_id": session.id,
            "created_at": session.created_at.to_rfc3339(),
            "config": session.config,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct SessionIdParams {
    session_id: String,
}

/// `session.info` — statistics and configuration. Read-only: the one
/// operation allowed against a completed session.
pub struct SessionInfo;

#[async_trait]
impl ToolHandler for SessionInfo {
    fn name(&self) -> &'static str {
        names::SESSION_INFO
    }

    fn description(&self) -> &'static str {
        "Get session statistics and configuration"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: SessionIdParams = parse_params(params)?;
        let session = engine.authenticate(&params.session_id).await?;

        let db = engine.db();
        let document_count = db.count_documents(&session.id).await?;
        let span_count = db.count_spans(&session.id).await?;
        let artifact_count = db.count_artifacts(&session.id).await?;
        let (total_chars, total_tokens_est) = db.session_stats(&session.id).await?;

        Ok(json!({
            "session_id": session.id,
            "name": session.name,
            "status": session.status.as_str(),
            "created_at": session.created_at.to_rfc3339(),
            "closed_at": session.closed_at.map(|t| t.to_rfc3339()),
            "document_count": document_count,
            "span_count": span_count,
            "artifact_count": artifact_count,
            "total_chars": total_chars,
            "total_tokens_est": total_tokens_est,
            "tool_calls_used": session.tool_calls_used,
            "tool_calls_remaining": session.config.max_tool_calls - session.tool_calls_used,
            "index_built": engine.index_cached(&session.id).await,
            "config": session.config,
        }))
    }
}

/// `session.close` — terminal transition. Persists the index snapshot,
/// evicts the cache, and removes the session's lock entry.
pub struct SessionClose;

#[async_trait]
impl ToolHandler for SessionClose {
    fn name(&self) -> &'static str {
        names::SESSION_CLOSE
    }

    fn description(&self) -> &'static str {
        "Mark session complete and persist its index snapshot"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" }
            },
            "required": ["session_id"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: SessionIdParams = parse_params(params)?;
        let closed = engine.close_session(&params.session_id).await?;

        let db = engine.db();
        let summary = SessionSummary {
            documents: db.count_documents(&closed.id).await?,
            spans: db.count_spans(&closed.id).await?,
            artifacts: db.count_artifacts(&closed.id).await?,
            tool_calls: db
                .get_session(&closed.id)
                .await?
                .map(|s| s.tool_calls_used)
                .unwrap_or(closed.tool_calls_used),
        };

        Ok(json!({
            "session_id": closed.id,
            "status": closed.status.as_str(),
            "closed_at": closed.closed_at.map(|t| t.to_rfc3339()),
            "summary": summary,
        }))
    }
}
