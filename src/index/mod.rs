//! Lexical index: BM25 ranking, tokenization, and snapshot persistence.
//!
//! Per session, a lazily built BM25 Okapi index over the session's documents.
//! Lifecycle:
//!
//! 1. `docs.load` stores documents; no index is built.
//! 2. The first `search.query` with the `bm25` method builds the index
//!    synchronously and caches it in memory.
//! 3. Subsequent searches reuse the cached index.
//! 4. `session.close` persists the index snapshot atomically; a later
//!    process can reload it if the fingerprint still matches.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`tokenizer`] | Named tokenizer abstraction; names are part of index identity |
//! | [`bm25`] | BM25 build/search, context windows, highlight extraction |
//! | [`persistence`] | Atomic snapshot write/load and fingerprint staleness |

pub mod bm25;
pub mod persistence;
pub mod tokenizer;
