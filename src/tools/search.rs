//! Search tool: `search.query`.
//!
//! Three methods share one result shape:
//!
//! | Method | Engine | Index |
//! |--------|--------|-------|
//! | `bm25` | ranked retrieval over the lazily built session index | yes |
//! | `regex` | case-insensitive pattern scan over document contents | no |
//! | `literal` | case-insensitive substring scan | no |
//!
//! The BM25 index is built on first use and cached per session; the result
//! reports `index_built` / `index_built_this_call` so callers can observe
//! which tier served them. Serialized results are capped by the session's
//! `max_chars_per_response` with a `truncated` flag.

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::engine::{truncate_chars, Engine, IndexTier};
use crate::errors::{EngineError, Result};
use crate::index::bm25::{extract_context, merge_highlights};
use crate::models::{Document, Highlight, SearchMatch, SpanRef};
use crate::tools::{names, parse_params, ToolHandler};

#[derive(Debug, Deserialize)]
struct SearchQueryParams {
    session_id: String,
    query: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    doc_ids: Option<Vec<String>>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_context_chars")]
    context_chars: usize,
}

fn default_method() -> String {
    "bm25".to_string()
}
fn default_limit() -> usize {
    10
}
fn default_context_chars() -> usize {
    200
}

/// `search.query` — lexical search over the session's documents.
pub struct SearchQuery;

#[async_trait]
impl ToolHandler for SearchQuery {
    fn name(&self) -> &'static str {
        names::SEARCH_QUERY
    }

    fn description(&self) -> &'static str {
        "Search documents; the BM25 index is lazy-built on first use"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "session_id": { "type": "string" },
                "query": { "type": "string" },
                "method": { "type": "string", "enum": ["bm25", "regex", "literal"], "default": "bm25" },
                "doc_ids": { "type": "array", "items": { "type": "string" } },
                "limit": { "type": "integer", "default": 10 },
                "context_chars": { "type": "integer", "default": 200 }
            },
            "required": ["session_id", "query"]
        })
    }

    async fn execute(&self, engine: &Engine, params: Value) -> Result<Value> {
        let params: SearchQueryParams = parse_params(params)?;
        let session = engine.authenticate(&params.session_id).await?;

        let (matches, index_built_this_call) = match params.method.as_str() {
            "bm25" => bm25_search(engine, &params).await?,
            "regex" => (regex_search(engine, &params).await?, false),
            "literal" => (literal_search(engine, &params).await?, false),
            other => {
                return Err(EngineError::invalid(
                    "method",
                    format!("unknown search method: {other}. Use bm25, regex, or literal."),
                ))
            }
        };

        // Cap cumulative snippet content at the session's response limit.
        let max_chars = session.config.max_chars_per_response;
        let total_matches = matches.len();
        let mut chars_used = 0usize;
        let mut truncated = false;
        let mut output: Vec<SearchMatch> = Vec::with_capacity(matches.len());
        for mut m in matches {
            let context_chars = m.context.chars().count();
            if chars_used + context_chars > max_chars {
                let remaining = max_chars - chars_used;
                truncated = true;
                if remaining > 0 {
                    let (cut, _) = truncate_chars(&m.context, remaining);
                    m.highlights.retain(|h| h.end <= cut.len());
                    m.context = cut;
                    chars_used = max_chars;
                    output.push(m);
                }
                break;
            }
            chars_used += context_chars;
            output.push(m);
        }

        Ok(json!({
            "matches": output,
            "total_matches": total_matches,
            "index_built": engine.index_cached(&params.session_id).await,
            "index_built_this_call": index_built_this_call,
            "truncated": truncated,
        }))
    }
}

/// Documents visible to this query, honoring the optional id restriction.
async fn candidate_documents(
    engine: &Engine,
    params: &SearchQueryParams,
) -> Result<Vec<Document>> {
    let docs = engine
        .db()
        .list_documents(&params.session_id, i64::MAX, 0)
        .await?;
    Ok(match &params.doc_ids {
        Some(ids) => docs.into_iter().filter(|d| ids.contains(&d.id)).collect(),
        None => docs,
    })
}

async fn bm25_search(
    engine: &Engine,
    params: &SearchQueryParams,
) -> Result<(Vec<SearchMatch>, bool)> {
    let (index, tier) = engine.get_or_build_index(&params.session_id).await?;
    let built_this_call = tier == IndexTier::Built;

    let tokenizer = engine.tokenizer();
    let query_tokens = tokenizer.tokenize(&params.query);
    if query_tokens.is_empty() {
        return Ok((Vec::new(), built_this_call));
    }

    // Score everything, then apply the optional doc filter before the limit
    // so a restricted search still returns up to `limit` matches.
    let scored = index.search(&query_tokens, index.doc_count());
    let allowed: Option<&Vec<String>> = params.doc_ids.as_ref();

    let mut matches = Vec::new();
    for hit in scored {
        if matches.len() >= params.limit {
            break;
        }
        if let Some(allowed) = allowed {
            if !allowed.contains(&hit.doc_id) {
                continue;
            }
        }

        let doc = match engine.db().get_document(&hit.doc_id).await? {
            Some(doc) => doc,
            None => continue,
        };
        let content = match engine.blobs().get(&doc.content_hash)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                tracing::warn!(
                    doc_id = %doc.id,
                    content_hash = %doc.content_hash,
                    "blob unreachable, match skipped"
                );
                continue;
            }
        };

        let window = extract_context(&content, &query_tokens, params.context_chars, tokenizer.as_ref());
        matches.push(SearchMatch {
            doc_id: doc.id.clone(),
            span: SpanRef {
                doc_id: doc.id,
                start: window.start,
                end: window.end,
            },
            score: hit.score,
            context: window.snippet,
            highlights: window.highlights,
        });
    }

    Ok((matches, built_this_call))
}

async fn regex_search(engine: &Engine, params: &SearchQueryParams) -> Result<Vec<SearchMatch>> {
    let pattern = RegexBuilder::new(&params.query)
        .case_insensitive(true)
        .build()
        .map_err(|e| EngineError::invalid("query", format!("invalid regex: {e}")))?;

    let docs = candidate_documents(engine, params).await?;
    let mut matches = Vec::new();

    'docs: for doc in docs {
        let content = match engine.blobs().get(&doc.content_hash)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                tracing::warn!(doc_id = %doc.id, "blob unreachable, document skipped");
                continue;
            }
        };

        for found in pattern.find_iter(&content) {
            if matches.len() >= params.limit {
                break 'docs;
            }
            // Zero-width matches carry no citable text.
            if found.start() == found.end() {
                continue;
            }
            matches.push(scan_match(
                &doc,
                &content,
                found.start(),
                found.end(),
                params.context_chars,
            ));
        }
    }

    Ok(matches)
}

async fn literal_search(engine: &Engine, params: &SearchQueryParams) -> Result<Vec<SearchMatch>> {
    if params.query.is_empty() {
        return Err(EngineError::invalid("query", "must not be empty"));
    }
    let needle = params.query.to_lowercase();
    let docs = candidate_documents(engine, params).await?;
    let mut matches = Vec::new();

    'docs: for doc in docs {
        let content = match engine.blobs().get(&doc.content_hash)? {
            Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            None => {
                tracing::warn!(doc_id = %doc.id, "blob unreachable, document skipped");
                continue;
            }
        };
        let haystack = content.to_lowercase();

        let mut pos = 0;
        while let Some(found) = haystack[pos..].find(&needle) {
            if matches.len() >= params.limit {
                break 'docs;
            }
            let start = pos + found;
            let end = start + needle.len();
            // Lowercasing can shift byte offsets for non-ASCII text; only
            // emit offsets that land on boundaries of the original.
            if content.is_char_boundary(start) && content.is_char_boundary(end) {
                matches.push(scan_match(&doc, &content, start, end, params.context_chars));
            }
            pos = start + 1;
        }
    }

    Ok(matches)
}

/// Build a match record for a scan hit at `[start, end)` in `content`.
fn scan_match(
    doc: &Document,
    content: &str,
    start: usize,
    end: usize,
    context_chars: usize,
) -> SearchMatch {
    let half = context_chars / 2;
    let mut window_start = start.saturating_sub(half);
    let mut window_end = (end + half).min(content.len());
    while window_start > 0 && !content.is_char_boundary(window_start) {
        window_start -= 1;
    }
    while window_end < content.len() && !content.is_char_boundary(window_end) {
        window_end += 1;
    }

    let snippet = content[window_start..window_end].to_string();
    let highlights = merge_highlights(vec![Highlight {
        start: start - window_start,
        end: end - window_start,
        terms: vec![content[start..end].to_string()],
    }]);

    SearchMatch {
        doc_id: doc.id.clone(),
        span: SpanRef {
            doc_id: doc.id.clone(),
            start: window_start,
            end: window_end,
        },
        score: 1.0,
        context: snippet,
        highlights,
    }
}
