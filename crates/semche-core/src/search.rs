//! Query engine with semantic, keyword, and hybrid retrieval modes.
//!
//! # Hybrid ranking
//!
//! 1. Fetch `2k` semantic candidates (vector similarity).
//! 2. Fetch `2k` keyword candidates (BM25 over chunk text).
//! 3. Fuse both rankings with reciprocal rank fusion, each list weighted
//!    [`HYBRID_WEIGHT`].
//! 4. Sort by fused score (desc), truncate to `k`.
//!
//! Semantic results carry similarity scores, keyword results BM25 scores
//! and hybrid results fused scores; scores are only comparable within a mode.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::embedding::normalize;
use crate::error::{Error, Result};
use crate::filter::MetadataFilter;
use crate::index::QueryHit;
use crate::keyword::{reciprocal_rank_fusion, Bm25};
use crate::models::Metadata;
use crate::store::DocumentStore;

pub const DEFAULT_TOP_K: usize = 5;

/// Weight of each ranked list in hybrid fusion.
pub const HYBRID_WEIGHT: f64 = 0.5;

/// How candidates are retrieved and ranked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Semantic,
    Keyword,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "semantic" => Ok(Self::Semantic),
            "keyword" => Ok(Self::Keyword),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(Error::Validation(format!(
                "Unknown search mode: {other}. Use semantic, keyword, or hybrid."
            ))),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Semantic => "semantic",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
        })
    }
}

/// A single ranked chunk.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub document_id: String,
    pub chunk_text: String,
    pub score: f32,
    pub metadata: Metadata,
}

/// Live collection statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    pub document_count: usize,
    pub chunk_count: usize,
    pub embedding_dimension: usize,
    pub collection_name: String,
}

pub struct QueryEngine {
    store: Arc<DocumentStore>,
}

impl QueryEngine {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Top-`k` chunks for `query` by vector similarity, best first.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>> {
        self.search_with_mode(query, k, filter, SearchMode::Semantic)
            .await
    }

    /// Top-`k` chunks for `query` in the given mode, best first. Each chunk
    /// is its own result; hits whose document has been deleted are dropped.
    pub async fn search_with_mode(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
        mode: SearchMode,
    ) -> Result<Vec<SearchResult>> {
        if query.trim().is_empty() {
            return Err(Error::Validation("query must not be empty".into()));
        }
        if k == 0 {
            return Err(Error::Validation("k must be at least 1".into()));
        }

        let hits = match mode {
            SearchMode::Semantic => self.semantic_hits(query, k, filter).await?,
            SearchMode::Keyword => self.keyword_hits(query, k, filter).await?,
            SearchMode::Hybrid => {
                let candidates = k.saturating_mul(2);
                let dense = self.semantic_hits(query, candidates, filter).await?;
                let sparse = self.keyword_hits(query, candidates, filter).await?;
                fuse(dense, sparse, k)
            }
        };

        let results: Vec<SearchResult> = hits
            .into_iter()
            .map(|hit| SearchResult {
                document_id: hit.document_id,
                chunk_text: hit.text,
                score: hit.score,
                metadata: hit.metadata,
            })
            .collect();

        tracing::debug!(k, %mode, returned = results.len(), "search complete");
        Ok(results)
    }

    async fn semantic_hits(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        let mut vector = self.store.embedder().embed_query(query).await?;
        if self.store.options().normalize_embeddings {
            normalize(&mut vector);
        }
        let hits = self.store.index().query(&vector, k, filter).await?;
        Ok(hits
            .into_iter()
            .filter(|hit| self.store.contains(&hit.document_id))
            .collect())
    }

    /// BM25 over the text of every live chunk that passes `filter`.
    async fn keyword_hits(
        &self,
        query: &str,
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        let filter = filter.filter(|f| !f.is_empty());
        let mut chunks: Vec<_> = self
            .store
            .index()
            .entries()
            .await?
            .into_iter()
            .map(|e| e.chunk)
            .filter(|c| filter.map_or(true, |f| f.matches(&c.metadata)))
            .filter(|c| self.store.contains(&c.document_id))
            .collect();
        chunks.sort_by(|a, b| a.id.cmp(&b.id));

        let bm25 = Bm25::new(chunks.iter().map(|c| c.text.as_str()));
        let ranked = bm25.top_k(query, k);
        let mut slots: Vec<Option<_>> = chunks.into_iter().map(Some).collect();
        Ok(ranked
            .into_iter()
            .filter_map(|(i, score)| {
                slots[i].take().map(|c| QueryHit {
                    chunk_id: c.id,
                    document_id: c.document_id,
                    text: c.text,
                    score: score as f32,
                    metadata: c.metadata,
                })
            })
            .collect())
    }

    pub async fn collection_info(&self) -> Result<CollectionInfo> {
        let config = self.store.index().config();
        Ok(CollectionInfo {
            document_count: self.store.document_count(),
            chunk_count: self.store.index().count().await?,
            embedding_dimension: config.dimension,
            collection_name: config.name.clone(),
        })
    }
}

/// Reciprocal rank fusion of semantic and keyword hits, keyed by chunk id.
fn fuse(dense: Vec<QueryHit>, sparse: Vec<QueryHit>, k: usize) -> Vec<QueryHit> {
    let dense_ids: Vec<String> = dense.iter().map(|h| h.chunk_id.clone()).collect();
    let sparse_ids: Vec<String> = sparse.iter().map(|h| h.chunk_id.clone()).collect();
    let fused = reciprocal_rank_fusion(&[
        (dense_ids.as_slice(), HYBRID_WEIGHT),
        (sparse_ids.as_slice(), HYBRID_WEIGHT),
    ]);

    let mut hits: HashMap<String, QueryHit> = sparse
        .into_iter()
        .chain(dense)
        .map(|h| (h.chunk_id.clone(), h))
        .collect();
    fused
        .into_iter()
        .take(k)
        .filter_map(|(id, score)| {
            hits.remove(&id).map(|hit| QueryHit {
                score: score as f32,
                ..hit
            })
        })
        .collect()
}
