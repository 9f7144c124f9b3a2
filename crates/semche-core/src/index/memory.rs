//! In-process [`VectorIndex`] backed by an HNSW graph.
//!
//! Entries and the graph sit behind one `parking_lot::RwLock`: writes take
//! the lock once per batch, so a query sees a batch either entirely or not
//! at all. Replacing a chunk tombstones its old graph node and inserts a
//! fresh one. Filtered queries traverse the whole graph but only collect
//! matching nodes; if the graph yields fewer than `k` matches the index
//! falls back to an exact scan.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::hnsw::HnswGraph;
use super::{QueryHit, VectorIndex};
use crate::embedding::similarity;
use crate::error::{Error, Result};
use crate::filter::MetadataFilter;
use crate::models::{Chunk, CollectionConfig, EmbeddedChunk};

struct Entry {
    chunk: Chunk,
    slot: usize,
}

struct IndexState {
    graph: HnswGraph,
    entries: HashMap<String, Entry>,
}

/// HNSW-backed in-memory vector index.
pub struct InMemoryIndex {
    config: CollectionConfig,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new(config: CollectionConfig) -> Result<Self> {
        config.validate()?;
        let graph = HnswGraph::new(config.metric, config.m, config.ef_construction);
        Ok(Self {
            config,
            state: RwLock::new(IndexState {
                graph,
                entries: HashMap::new(),
            }),
        })
    }

    /// Build an index pre-populated with `entries` (e.g. from a snapshot).
    pub fn with_entries(config: CollectionConfig, entries: Vec<EmbeddedChunk>) -> Result<Self> {
        let index = Self::new(config)?;
        index.validate(&entries)?;
        {
            let mut state = index.state.write();
            for entry in entries {
                insert_entry(&mut state, entry);
            }
        }
        Ok(index)
    }

    fn validate(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        for ec in chunks {
            if ec.vector.len() != self.config.dimension {
                return Err(Error::index_write(
                    "upsert",
                    &ec.chunk.id,
                    format!(
                        "vector has dimension {}, collection '{}' expects {}",
                        ec.vector.len(),
                        self.config.name,
                        self.config.dimension
                    ),
                ));
            }
            if ec.vector.iter().any(|x| !x.is_finite()) {
                return Err(Error::index_write(
                    "upsert",
                    &ec.chunk.id,
                    "vector contains NaN or infinite values",
                ));
            }
        }
        Ok(())
    }

    fn compact_if_needed(&self, state: &mut IndexState) {
        if !state.graph.needs_compaction() {
            return;
        }
        let mut live: Vec<(String, Vec<f32>)> = state
            .entries
            .iter()
            .map(|(id, e)| (id.clone(), state.graph.vector(e.slot).to_vec()))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));

        let mut graph = HnswGraph::new(self.config.metric, self.config.m, self.config.ef_construction);
        for (id, vector) in live {
            let slot = graph.insert(&id, vector);
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.slot = slot;
            }
        }
        tracing::debug!(
            collection = %self.config.name,
            live = graph.live_len(),
            "compacted hnsw graph"
        );
        state.graph = graph;
    }

    fn to_hit(&self, state: &IndexState, entry: &Entry, query: &[f32]) -> QueryHit {
        QueryHit {
            chunk_id: entry.chunk.id.clone(),
            document_id: entry.chunk.document_id.clone(),
            text: entry.chunk.text.clone(),
            score: similarity(self.config.metric, query, state.graph.vector(entry.slot)),
            metadata: entry.chunk.metadata.clone(),
        }
    }
}

fn insert_entry(state: &mut IndexState, ec: EmbeddedChunk) {
    if let Some(old) = state.entries.remove(&ec.chunk.id) {
        state.graph.remove(old.slot);
    }
    let slot = state.graph.insert(&ec.chunk.id, ec.vector);
    state.entries.insert(ec.chunk.id.clone(), Entry { chunk: ec.chunk, slot });
}

fn remove_entry(state: &mut IndexState, id: &str) -> bool {
    match state.entries.remove(id) {
        Some(entry) => {
            state.graph.remove(entry.slot);
            true
        }
        None => false,
    }
}

fn sort_hits(hits: &mut [QueryHit]) {
    hits.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn config(&self) -> &CollectionConfig {
        &self.config
    }

    async fn upsert(&self, chunks: Vec<EmbeddedChunk>) -> Result<usize> {
        self.validate(&chunks)?;
        let written = chunks.len();
        let mut state = self.state.write();
        for ec in chunks {
            insert_entry(&mut state, ec);
        }
        self.compact_if_needed(&mut state);
        Ok(written)
    }

    async fn delete_ids(&self, ids: &[String]) -> Result<usize> {
        let mut state = self.state.write();
        let removed = ids.iter().filter(|id| remove_entry(&mut state, id)).count();
        self.compact_if_needed(&mut state);
        Ok(removed)
    }

    async fn delete_where(&self, filter: &MetadataFilter) -> Result<usize> {
        let mut state = self.state.write();
        let doomed: Vec<String> = state
            .entries
            .values()
            .filter(|e| filter.matches(&e.chunk.metadata))
            .map(|e| e.chunk.id.clone())
            .collect();
        for id in &doomed {
            remove_entry(&mut state, id);
        }
        self.compact_if_needed(&mut state);
        Ok(doomed.len())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<QueryHit>> {
        if vector.len() != self.config.dimension {
            return Err(Error::IndexQuery(format!(
                "query vector has dimension {}, collection '{}' expects {}",
                vector.len(),
                self.config.name,
                self.config.dimension
            )));
        }
        let filter = filter.filter(|f| !f.is_empty());
        let state = self.state.read();
        if k == 0 || state.entries.is_empty() {
            return Ok(Vec::new());
        }

        let accepts = |slot: usize| match filter {
            None => true,
            Some(f) => state
                .entries
                .get(state.graph.key(slot))
                .is_some_and(|e| e.slot == slot && f.matches(&e.chunk.metadata)),
        };
        let found = state.graph.search(vector, k, self.config.ef_search, accepts);

        let mut hits: Vec<QueryHit> = found
            .iter()
            .filter_map(|c| state.entries.get(state.graph.key(c.slot)))
            .map(|e| self.to_hit(&state, e, vector))
            .collect();

        let reachable = state.entries.len().min(k);
        if hits.len() < reachable && (filter.is_some() || hits.len() < state.graph.live_len().min(k)) {
            tracing::debug!(
                collection = %self.config.name,
                approximate = hits.len(),
                k,
                "falling back to exact scan"
            );
            hits = state
                .entries
                .values()
                .filter(|e| filter.map_or(true, |f| f.matches(&e.chunk.metadata)))
                .map(|e| self.to_hit(&state, e, vector))
                .collect();
        }

        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    async fn get(&self, ids: &[String]) -> Result<Vec<EmbeddedChunk>> {
        let state = self.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| EmbeddedChunk {
                chunk: e.chunk.clone(),
                vector: state.graph.vector(e.slot).to_vec(),
            })
            .collect())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.state.read().entries.len())
    }

    async fn entries(&self) -> Result<Vec<EmbeddedChunk>> {
        let state = self.state.read();
        let mut all: Vec<EmbeddedChunk> = state
            .entries
            .values()
            .map(|e| EmbeddedChunk {
                chunk: e.chunk.clone(),
                vector: state.graph.vector(e.slot).to_vec(),
            })
            .collect();
        all.sort_by(|a, b| a.chunk.id.cmp(&b.chunk.id));
        Ok(all)
    }
}
