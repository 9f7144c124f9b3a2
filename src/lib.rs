//! # Semche
//!
//! Semantic document search served to AI tools over MCP.
//!
//! Documents are split into overlapping chunks, embedded, and stored in an
//! in-memory HNSW index that is persisted as a snapshot on disk. Callers
//! index, search, list, and delete documents through MCP tools or the CLI.
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌─────────────┐
//! │ MCP/CLI  │──▶│ DocumentStore│──▶│ HNSW index  │
//! │  tools   │   │ chunk+embed  │   │  snapshot   │
//! └──────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! The engine itself lives in `semche-core`; this crate adds configuration,
//! logging, embedding providers, persistence, and the protocol surfaces.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Layered configuration (defaults, TOML, environment) |
//! | [`logging`] | tracing subscriber setup |
//! | [`embedding`] | Embedding provider construction |
//! | [`collection`] | Open, persist, and close a collection |
//! | [`tools`] | MCP tool handlers |
//! | [`mcp`] | rmcp stdio server |
//! | [`register`] | Bulk file registration |

pub mod collection;
pub mod config;
pub mod embedding;
pub mod logging;
pub mod mcp;
pub mod register;
pub mod tools;
