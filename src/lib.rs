//! # Corpus Harness
//!
//! **A session-scoped retrieval and provenance engine for recursive language
//! model workflows.**
//!
//! A controller (typically a language model client) loads documents into a
//! session, probes and chunks them, runs lexical search, and stores derived
//! artifacts that cite the exact byte ranges they were produced from. The
//! engine never calls a model itself; it is the world the model queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────────────────────┐   ┌───────────┐
//! │  MCP stdio │──▶│       Session Runtime       │──▶│  SQLite   │
//! │  (tools)   │   │ budget · locks · traces ·   │   │ metadata  │
//! └────────────┘   │ response caps               │   └───────────┘
//!                  └──────┬──────────┬───────────┘
//!                         ▼          ▼
//!                  ┌───────────┐  ┌──────────────────┐
//!                  │ Blob store│  │  BM25 index      │
//!                  │ (SHA-256) │  │ cache + snapshot │
//!                  └───────────┘  └──────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. **`docs.load`** ingests inline literals, files, directories, and glob
//!    patterns concurrently (bounded by a semaphore), stores bytes in the
//!    content-addressed [`blobs`] store, and commits document rows in one
//!    batch.
//! 2. **`chunk.create`** materializes half-open byte ranges as [`models::Span`]s
//!    via the pure strategies in [`chunk`].
//! 3. **`search.query`** lazily builds a per-session BM25 index ([`index`]),
//!    cached in memory and snapshotted on close; `regex` and `literal`
//!    methods scan blob contents directly.
//! 4. **`artifact.store`** records derived results with span provenance.
//! 5. Every call is budget-charged, traced, and response-capped by the
//!    runtime ([`engine`], [`tools`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML server configuration and derived paths |
//! | [`logging`] | tracing subscriber setup (level, JSON, file sink) |
//! | [`models`] | Core data types: `Session`, `Document`, `Span`, `Artifact`, `TraceEntry` |
//! | [`errors`] | Closed error set with machine-readable kind tags |
//! | [`blobs`] | Content-addressed byte storage keyed by SHA-256 |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Forward-only numbered schema migrations |
//! | [`store`] | Metadata store: entities, atomic budget charge, batch insert |
//! | [`chunk`] | Chunking strategies: fixed, lines, delimiter |
//! | [`index`] | BM25 build/search, tokenizers, snapshot persistence |
//! | [`engine`] | Session runtime: locks, index cache, close protocol |
//! | [`loader`] | Bounded concurrent source loader for `docs.load` |
//! | [`tools`] | Typed tool handlers and the call envelope |
//! | [`mcp`] | MCP stdio bridge with canonical tool naming |

pub mod blobs;
pub mod chunk;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod index;
pub mod loader;
pub mod logging;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod store;
pub mod tools;

pub use engine::Engine;
pub use errors::EngineError;
