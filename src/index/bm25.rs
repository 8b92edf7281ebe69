//! BM25 Okapi ranked retrieval.
//!
//! The index is built once per session from the full document set and scored
//! with the classic Okapi formula:
//!
//! ```text
//! score(D, Q) = Σ_t idf(t) · tf(t,D)·(k1+1) / (tf(t,D) + k1·(1−b+b·|D|/avgdl))
//! idf(t)      = ln((N − df(t) + 0.5) / (df(t) + 0.5))
//! ```
//!
//! `k1` and `b` are fixed per index version and recorded in the serialized
//! payload. Scores can be negative (idf goes negative for terms in more than
//! half the corpus); results are never filtered on that basis.
//!
//! The serialized form is self-describing JSON carrying the vocabulary
//! document frequencies, per-document term frequencies, the document-id
//! vector, document lengths, and the parameters, plus `index_version`.
//! Snapshots of any other version are refused at load time.

use std::collections::{HashMap, HashSet};
use serde::{Deserialize, Serialize};

use crate::index::tokenizer::Tokenizer;
use crate::models::Highlight;

/// Version of the serialized payload. Bump on any change to the scoring
/// parameters, the payload shape, or their semantics.
pub const INDEX_VERSION: u32 = 1;

/// Fixed Okapi parameters for index version 1.
pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;

/// A BM25 index over one session's documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bm25Index {
    pub index_version: u32,
    pub tokenizer: String,
    pub k1: f64,
    pub b: f64,
    /// Indexed document ids, in insertion order.
    pub doc_ids: Vec<String>,
    /// Token count per document, parallel to `doc_ids`.
    pub doc_lengths: Vec<usize>,
    /// Term frequencies per document, parallel to `doc_ids`.
    pub term_freqs: Vec<HashMap<String, u32>>,
    /// Number of documents containing each term.
    pub doc_freqs: HashMap<String, u32>,
    pub avgdl: f64,
}

/// A document scored against a query.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredDoc {
    pub doc_id: String,
    pub score: f64,
}

impl Bm25Index {
    /// Build an index from `(doc_id, token stream)` pairs.
    pub fn build<I>(tokenizer_name: &str, docs: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut doc_ids = Vec::new();
        let mut doc_lengths = Vec::new();
        let mut term_freqs: Vec<HashMap<String, u32>> = Vec::new();
        let mut doc_freqs: HashMap<String, u32> = HashMap::new();

        for (doc_id, tokens) in docs {
            let mut freqs: HashMap<String, u32> = HashMap::new();
            for token in &tokens {
                *freqs.entry(token.clone()).or_insert(0) += 1;
            }
            for term in freqs.keys() {
                *doc_freqs.entry(term.clone()).or_insert(0) += 1;
            }
            doc_ids.push(doc_id);
            doc_lengths.push(tokens.len());
            term_freqs.push(freqs);
        }

        let avgdl = if doc_lengths.is_empty() {
            0.0
        } else {
            doc_lengths.iter().sum::<usize>() as f64 / doc_lengths.len() as f64
        };

        Self {
            index_version: INDEX_VERSION,
            tokenizer: tokenizer_name.to_string(),
            k1: K1,
            b: B,
            doc_ids,
            doc_lengths,
            term_freqs,
            doc_freqs,
            avgdl,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn doc_count(&self) -> usize {
        self.doc_ids.len()
    }

    /// Score every indexed document against the query tokens and return the
    /// top `limit`, ordered by score descending then document id for a
    /// stable ranking.
    ///
    /// A document is a match when it contains at least one query term; among
    /// matches, zero and negative scores are kept (idf goes negative for
    /// terms in more than half the corpus).
    pub fn search(&self, query_tokens: &[String], limit: usize) -> Vec<ScoredDoc> {
        if self.doc_ids.is_empty() || query_tokens.is_empty() {
            return Vec::new();
        }

        let n = self.doc_ids.len() as f64;
        let mut scored: Vec<ScoredDoc> = self
            .doc_ids
            .iter()
            .enumerate()
            .filter_map(|(i, doc_id)| {
                let dl = self.doc_lengths[i] as f64;
                let norm = self.k1 * (1.0 - self.b + self.b * dl / self.avgdl.max(f64::MIN_POSITIVE));
                let mut score = 0.0;
                let mut matched = false;
                for term in query_tokens {
                    let tf = *self.term_freqs[i].get(term).unwrap_or(&0) as f64;
                    if tf == 0.0 {
                        continue;
                    }
                    matched = true;
                    let df = *self.doc_freqs.get(term).unwrap_or(&0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5)).ln();
                    score += idf * tf * (self.k1 + 1.0) / (tf + norm);
                }
                matched.then(|| ScoredDoc {
                    doc_id: doc_id.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        scored.truncate(limit);
        scored
    }
}

/// A context window extracted around the best query match in a document.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    /// Half-open byte range of the window within the document.
    pub start: usize,
    pub end: usize,
    /// The window's text.
    pub snippet: String,
    /// Merged highlight ranges, relative to the snippet.
    pub highlights: Vec<Highlight>,
}

/// Extract a context window of roughly `context_chars` bytes around the
/// first query-token occurrence in `content`, with highlights for every
/// query-token occurrence inside the window.
///
/// Falls back to a window at the start of the document when no token
/// occurs, so the caller always gets a citable span reference.
pub fn extract_context(
    content: &str,
    query_tokens: &[String],
    context_chars: usize,
    tokenizer: &dyn Tokenizer,
) -> ContextWindow {
    let query_set: HashSet<&str> = query_tokens.iter().map(|s| s.as_str()).collect();
    let content_tokens = tokenizer.tokenize_with_offsets(content);

    let first_match = content_tokens
        .iter()
        .find(|t| query_set.contains(t.text.as_str()));

    let (anchor_start, anchor_end) = match first_match {
        Some(token) => (token.start, token.end),
        None => (0, 0),
    };

    let half = context_chars / 2;
    let mut start = anchor_start.saturating_sub(half);
    let mut end = (anchor_end + half).min(content.len());
    // Snap to char boundaries.
    while start > 0 && !content.is_char_boundary(start) {
        start -= 1;
    }
    while end < content.len() && !content.is_char_boundary(end) {
        end += 1;
    }

    let snippet = content[start..end].to_string();

    let raw_highlights: Vec<Highlight> = content_tokens
        .iter()
        .filter(|t| query_set.contains(t.text.as_str()) && t.start >= start && t.end <= end)
        .map(|t| Highlight {
            start: t.start - start,
            end: t.end - start,
            terms: vec![t.text.clone()],
        })
        .collect();

    ContextWindow {
        start,
        end,
        snippet,
        highlights: merge_highlights(raw_highlights),
    }
}

/// Merge overlapping or touching highlight ranges. A merged region carries
/// the union of the terms it covers, deduplicated, in first-seen order.
pub fn merge_highlights(mut highlights: Vec<Highlight>) -> Vec<Highlight> {
    highlights.sort_by_key(|h| (h.start, h.end));
    let mut merged: Vec<Highlight> = Vec::new();

    for h in highlights {
        match merged.last_mut() {
            Some(last) if h.start <= last.end => {
                last.end = last.end.max(h.end);
                for term in h.terms {
                    if !last.terms.contains(&term) {
                        last.terms.push(term);
                    }
                }
            }
            _ => merged.push(h),
        }
    }

    merged
}
