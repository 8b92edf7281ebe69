//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to an MCP server over stdio, which is the
//! request/response channel controllers use to drive the engine. Tools are
//! exposed via `list_tools` / `call_tool`; every result is a typed success
//! record or a typed error record (`{ "error": { "kind", "message" } }`).
//!
//! # Canonical names
//!
//! Canonical dotted names (`session.create`, `docs.load`, …) are an
//! interface contract and must reach the transport verbatim. Names are
//! validated against the transport's permitted pattern at startup; in strict
//! mode (the default) a name the transport cannot carry aborts startup with
//! a naming failure. With `allow_noncanonical_tool_names` set, invalid names
//! fall back to fabricated ones (dots become underscores) and a single
//! warning is emitted.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use serde_json::json;

use crate::engine::Engine;
use crate::errors::{EngineError, Result};
use crate::tools::{dispatch, ToolHandler, ToolRegistry};

/// Characters the transport accepts in a tool name. Dots are included: the
/// canonical names are presented verbatim.
fn transport_accepts(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Fabricated fallback for a name the transport rejects.
fn fabricate_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Resolve the wire name for every registered tool.
///
/// Returns `(wire_name, canonical_name)` pairs. In strict mode a name the
/// transport cannot register verbatim is a startup failure; otherwise the
/// fabricated fallback is used and one warning is emitted for the whole set.
pub fn resolve_tool_names(
    registry: &ToolRegistry,
    allow_noncanonical: bool,
) -> Result<Vec<(String, &'static str)>> {
    let mut resolved = Vec::with_capacity(registry.tools().len());
    let mut warned = false;

    for tool in registry.tools() {
        let canonical = tool.name();
        if transport_accepts(canonical) {
            resolved.push((canonical.to_string(), canonical));
            continue;
        }

        if !allow_noncanonical {
            return Err(EngineError::ToolNamingFailure {
                name: canonical.to_string(),
            });
        }

        if !warned {
            tracing::warn!(
                "transport cannot register canonical tool names verbatim; \
                 falling back to fabricated names. Clients expecting canonical \
                 names may not work correctly."
            );
            warned = true;
        }
        resolved.push((fabricate_name(canonical), canonical));
    }

    Ok(resolved)
}

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct (everything is behind
/// `Arc`), so all sessions share the same engine and tool set.
#[derive(Clone)]
pub struct McpBridge {
    engine: Arc<Engine>,
    registry: Arc<ToolRegistry>,
    /// `(wire name, canonical name)` for every tool, resolved at startup.
    names: Arc<Vec<(String, &'static str)>>,
}

impl McpBridge {
    pub fn new(engine: Arc<Engine>) -> Result<Self> {
        let registry = ToolRegistry::with_builtins();
        let names = resolve_tool_names(
            &registry,
            engine.config().allow_noncanonical_tool_names,
        )?;
        Ok(Self {
            engine,
            registry: Arc::new(registry),
            names: Arc::new(names),
        })
    }

    fn canonical_for_wire(&self, wire: &str) -> Option<&'static str> {
        self.names
            .iter()
            .find(|(w, _)| w == wire)
            .map(|(_, canonical)| *canonical)
    }

    fn to_mcp_tool(wire_name: &str, tool: &dyn ToolHandler) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(wire_name.to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: None,
            icons: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "corpus-harness".to_string(),
                title: Some("Corpus Harness".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Corpus Harness — session-scoped retrieval and provenance engine for \
                 recursive language model workflows. Create a session, load documents \
                 into it, then probe them with docs.peek, chunk.create, span.get, and \
                 search.query; store derived results with artifact.store. Every result \
                 cites the exact byte range it came from."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = std::result::Result<ListToolsResult, McpError>> + Send + '_
    {
        let tools: Vec<Tool> = self
            .names
            .iter()
            .filter_map(|(wire, canonical)| {
                self.registry
                    .find(canonical)
                    .map(|tool| Self::to_mcp_tool(wire, tool))
            })
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let canonical = self.canonical_for_wire(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;
        let tool = self.registry.find(canonical).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match dispatch(&self.engine, tool, params).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => {
                let record = json!({
                    "error": { "kind": e.kind(), "message": e.to_string() }
                });
                let text = serde_json::to_string_pretty(&record).unwrap_or_default();
                Ok(CallToolResult::error(vec![Content::text(text)]))
            }
        }
    }
}

/// Serve the bridge over stdio until the client disconnects.
pub async fn run_stdio(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bridge = McpBridge::new(engine)?;
    let service = bridge.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_names_pass_transport() {
        let registry = ToolRegistry::with_builtins();
        let resolved = resolve_tool_names(&registry, false).unwrap();
        for (wire, canonical) in &resolved {
            assert_eq!(wire, canonical, "canonical name must ship verbatim");
        }
    }

    #[test]
    fn test_fabricated_name_replaces_dots() {
        assert_eq!(fabricate_name("session.create"), "session_create");
        assert_eq!(fabricate_name("weird name!"), "weird_name_");
    }

    #[test]
    fn test_transport_pattern() {
        assert!(transport_accepts("session.create"));
        assert!(transport_accepts("a-b_c.d"));
        assert!(!transport_accepts(""));
        assert!(!transport_accepts("has space"));
        assert!(!transport_accepts(&"x".repeat(200)));
    }
}
