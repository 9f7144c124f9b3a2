//! Vector index abstraction.
//!
//! The [`VectorIndex`] trait is everything the document store and query
//! engine need from vector storage, so an in-process index and a remote
//! vector database are interchangeable behind `Arc<dyn VectorIndex>`.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorIndex::upsert) | Insert new chunks, replace existing ones by id |
//! | [`delete_ids`](VectorIndex::delete_ids) | Remove chunks by id |
//! | [`delete_where`](VectorIndex::delete_where) | Remove chunks matching a metadata filter |
//! | [`query`](VectorIndex::query) | k-nearest-neighbor search, optionally filtered |
//! | [`get`](VectorIndex::get) | Fetch stored chunks and vectors by id |
//! | [`count`](VectorIndex::count) | Number of stored chunks |
//! | [`entries`](VectorIndex::entries) | Every stored chunk, for snapshots |

mod hnsw;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::filter::MetadataFilter;
use crate::models::{CollectionConfig, EmbeddedChunk, Metadata};

pub use memory::InMemoryIndex;

/// One nearest-neighbor result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryHit {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Similarity under the collection metric; higher is closer.
    pub score: f32,
    pub metadata: Metadata,
}

/// Abstract vector storage.
///
/// Contract for implementations:
///
/// - `upsert` is all-or-nothing per call: inputs are validated before any
///   entry changes.
/// - Deleting an id that does not exist is a no-op.
/// - `query` returns at most `k` hits, sorted by score descending, and every
///   hit satisfies the filter exactly.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Settings this collection was created with.
    fn config(&self) -> &CollectionConfig;

    /// Insert or replace chunks. Returns the number written.
    async fn upsert(&self, chunks: Vec<EmbeddedChunk>) -> Result<usize>;

    /// Remove chunks by id. Returns the number removed.
    async fn delete_ids(&self, ids: &[String]) -> Result<usize>;

    /// Remove every chunk whose metadata matches `filter`.
    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize>;

    /// Nearest chunks to `vector`.
    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>>;

    /// Fetch chunks by id; unknown ids are skipped.
    async fn get(&self, ids: &[String]) -> Result<Vec<EmbeddedChunk>>;

    /// Number of stored chunks.
    async fn count(&self) -> Result<usize>;

    /// Every stored chunk, ordered by chunk id.
    async fn entries(&self) -> Result<Vec<EmbeddedChunk>>;
}
