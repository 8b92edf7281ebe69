//! Tool surface: typed handlers over the engine.
//!
//! Handlers form a closed set across six categories — session, docs, chunk,
//! span, search, artifact — registered in a [`ToolRegistry`]. Canonical
//! dotted names are data ([`names`]), separate from the handler types, and
//! are presented verbatim to the transport.
//!
//! # The call envelope
//!
//! Every invocation flows through [`dispatch`], which implements the outer
//! protocol of a tool call:
//!
//! 1. **Authenticate** — look up the session; fail closed if absent or
//!    completed (read-only `session.info` is exempt from the state check).
//! 2. **Charge** — one atomic budget increment; denial aborts before any
//!    side effect. `session.create` alone is charged after execution, and
//!    the exemption matches that exact canonical name.
//! 3. **Dispatch** — run the handler.
//! 4. **Trace** — append a trace entry with input/output summaries, the
//!    duration, the success flag, and the call's correlation id. A failed
//!    trace append is logged and never fails the operation.

pub mod artifacts;
pub mod chunks;
pub mod docs;
pub mod search;
pub mod session;

use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::Instrument;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::models::{generate_id, SessionStatus, TraceEntry};
use crate::store::Charge;

/// Canonical tool names. An interface contract: these exact strings are what
/// the transport must register and what trace entries record.
pub mod names {
    pub const SESSION_CREATE: &str = "session.create";
    pub const SESSION_INFO: &str = "session.info";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const DOCS_LOAD: &str = "docs.load";
    pub const DOCS_LIST: &str = "docs.list";
    pub const DOCS_PEEK: &str = "docs.peek";
    pub const CHUNK_CREATE: &str = "chunk.create";
    pub const SPAN_GET: &str = "span.get";
    pub const SEARCH_QUERY: &str = "search.query";
    pub const ARTIFACT_STORE: &str = "artifact.store";
    pub const ARTIFACT_LIST: &str = "artifact.list";
    pub const ARTIFACT_GET: &str = "artifact.get";
}

/// A single tool: canonical name, discovery metadata, and the typed handler.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Canonical dotted name, e.g. `search.query`.
    fn name(&self) -> &'static str;

    /// One-line description for transport discovery.
    fn description(&self) -> &'static str;

    /// JSON Schema for the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. Called inside the envelope after authentication and
    /// budget charging.
    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value>;
}

/// Registry of every tool the engine exposes.
pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// The full tool surface, in category order.
    pub fn with_builtins() -> Self {
        Self {
            tools: vec![
                Box::new(session::SessionCreate),
                Box::new(session::SessionInfo),
                Box::new(session::SessionClose),
                Box::new(docs::DocsLoad),
                Box::new(docs::DocsList),
                Box::new(docs::DocsPeek),
                Box::new(chunks::ChunkCreate),
                Box::new(chunks::SpanGet),
                Box::new(search::SearchQuery),
                Box::new(artifacts::ArtifactStore),
                Box::new(artifacts::ArtifactList),
                Box::new(artifacts::ArtifactGet),
            ],
        }
    }

    pub fn tools(&self) -> &[Box<dyn ToolHandler>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

/// Deserialize tool arguments, reporting failures as caller-fixable errors.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| EngineError::invalid("arguments", e.to_string()))
}

/// Run one tool call through the full envelope.
pub async fn dispatch(engine: &Engine, tool: &dyn ToolHandler, params: Value) -> Result<Value> {
    let correlation_id = generate_id();
    let operation = tool.name();
    let span = tracing::info_span!("tool_call", operation, correlation_id = %correlation_id);

    async {
        let start = Instant::now();
        let session_id = params
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        tracing::info!(session_id = session_id.as_deref(), "starting operation");

        // session.create has no session to authenticate or pre-charge; it is
        // charged once, after the session row exists. Exact-name match only.
        let precharged = operation != names::SESSION_CREATE;
        if precharged {
            let session_id = session_id
                .as_deref()
                .ok_or_else(|| EngineError::invalid("session_id", "missing required field"))?;
            let session = engine.authenticate(session_id).await?;

            if session.status == SessionStatus::Completed && operation != names::SESSION_INFO {
                if operation == names::SESSION_CLOSE {
                    return Err(EngineError::SessionAlreadyClosed {
                        session_id: session_id.to_string(),
                    });
                }
                return Err(EngineError::SessionClosed {
                    session_id: session_id.to_string(),
                });
            }

            match engine.db().try_increment_tool_calls(session_id).await? {
                Charge::Allowed(_) => {}
                Charge::Denied { used, limit } => {
                    return Err(EngineError::BudgetExceeded {
                        session_id: session_id.to_string(),
                        used,
                        limit,
                    });
                }
            }
        }

        let input_summary = summarize_input(&params);
        let result = tool.execute(engine, params).await;
        let duration_ms = start.elapsed().as_millis() as i64;

        // The created session pays for its own creation.
        let traced_session = match (&result, precharged) {
            (Ok(output), false) => {
                let new_id = output
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(ref new_id) = new_id {
                    if let Charge::Denied { used, limit } =
                        engine.db().try_increment_tool_calls(new_id).await?
                    {
                        return Err(EngineError::BudgetExceeded {
                            session_id: new_id.clone(),
                            used,
                            limit,
                        });
                    }
                }
                new_id
            }
            _ => session_id.clone(),
        };

        match &result {
            Ok(output) => {
                tracing::info!(duration_ms, "operation completed");
                if let Some(traced_session) = &traced_session {
                    append_trace(
                        engine,
                        traced_session,
                        operation,
                        input_summary,
                        summarize_output(output),
                        duration_ms,
                        true,
                        &correlation_id,
                    )
                    .await;
                }
            }
            Err(e) => {
                tracing::error!(duration_ms, error = %e, kind = e.kind(), "operation failed");
                if let Some(traced_session) = &traced_session {
                    append_trace(
                        engine,
                        traced_session,
                        operation,
                        input_summary,
                        json!({ "error": e.kind() }),
                        duration_ms,
                        false,
                        &correlation_id,
                    )
                    .await;
                }
            }
        }

        result
    }
    .instrument(span)
    .await
}

#[allow(clippy::too_many_arguments)]
async fn append_trace(
    engine: &Engine,
    session_id: &str,
    operation: &str,
    input_summary: Value,
    output_summary: Value,
    duration_ms: i64,
    success: bool,
    correlation_id: &str,
) {
    let trace = TraceEntry {
        id: generate_id(),
        session_id: session_id.to_string(),
        timestamp: chrono::Utc::now(),
        operation: operation.to_string(),
        input_summary,
        output_summary,
        duration_ms,
        success,
        correlation_id: correlation_id.to_string(),
    };
    if let Err(e) = engine.db().append_trace(&trace).await {
        // Trace loss must never fail the underlying operation.
        tracing::warn!(session_id, operation, error = %e, "failed to append trace entry");
    }
}

/// Input summary: argument keys only, never payload bytes.
fn summarize_input(params: &Value) -> Value {
    match params {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            json!({ "keys": keys })
        }
        _ => json!({ "keys": [] }),
    }
}

/// Output summary: per-key shape descriptors instead of content.
fn summarize_output(output: &Value) -> Value {
    match output {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let descriptor = match v {
                        Value::Array(items) => json!({ "count": items.len() }),
                        Value::String(s) => json!({ "chars": s.chars().count() }),
                        Value::Object(_) => json!("object"),
                        scalar => scalar.clone(),
                    };
                    (k.clone(), descriptor)
                })
                .collect(),
        ),
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_contains_all_canonical_names() {
        let registry = ToolRegistry::with_builtins();
        let expected = [
            names::SESSION_CREATE,
            names::SESSION_INFO,
            names::SESSION_CLOSE,
            names::DOCS_LOAD,
            names::DOCS_LIST,
            names::DOCS_PEEK,
            names::CHUNK_CREATE,
            names::SPAN_GET,
            names::SEARCH_QUERY,
            names::ARTIFACT_STORE,
            names::ARTIFACT_LIST,
            names::ARTIFACT_GET,
        ];
        assert_eq!(registry.tools().len(), expected.len());
        for name in expected {
            assert!(registry.find(name).is_some(), "missing tool: {name}");
        }
    }

    #[test]
    fn test_summaries_carry_no_content() {
        let input = json!({ "session_id": "s", "query": "secret text" });
        let summary = summarize_input(&input);
        assert!(!summary.to_string().contains("secret"));

        let output = json!({ "content": "secret body", "matches": [1, 2, 3] });
        let summary = summarize_output(&output);
        let text = summary.to_string();
        assert!(!text.contains("secret"));
        assert!(text.contains("\"count\":3"));
    }
}
