//! # semche core
//!
//! The indexing and retrieval engine behind `semche`: data models,
//! recursive text chunking, the embedding provider trait, an in-process
//! HNSW vector index, BM25 keyword scoring, the document store that keeps
//! records and index consistent, and the query engine.
//!
//! Nothing here touches the filesystem, the network, or the process
//! environment. The `semche` app crate wires in configuration,
//! persistence, network embedding providers, and the MCP transport.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod index;
pub mod keyword;
pub mod models;
pub mod search;
pub mod store;

pub use error::{Error, Result};
