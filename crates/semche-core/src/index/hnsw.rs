//! Hierarchical navigable small world graph.
//!
//! Nodes live in a slot vector and are never moved. Removing a node only
//! tombstones it: it stays traversable (so the graph keeps its
//! connectivity) but is never returned or chosen as a new neighbor. The
//! owning index rebuilds the graph once tombstones dominate.
//!
//! Node levels come from a SHA-256 of the node key rather than an RNG, so
//! the same insertion sequence always yields the same graph.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use sha2::{Digest, Sha256};

use crate::embedding::{cosine_similarity, dot_product, euclidean_distance};
use crate::models::DistanceMetric;

const MAX_LEVEL: usize = 16;

#[derive(Debug, Clone, Copy)]
pub(crate) struct Candidate {
    pub dist: f32,
    pub slot: usize,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then(self.slot.cmp(&other.slot))
    }
}

#[derive(Debug)]
struct Node {
    key: String,
    vector: Vec<f32>,
    /// Neighbor slots per layer, `neighbors[0]` being the base layer.
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Debug)]
pub(crate) struct HnswGraph {
    metric: DistanceMetric,
    m: usize,
    m0: usize,
    ef_construction: usize,
    level_mult: f64,
    nodes: Vec<Node>,
    entry_point: Option<usize>,
    max_level: usize,
    tombstones: usize,
}

impl HnswGraph {
    pub fn new(metric: DistanceMetric, m: usize, ef_construction: usize) -> Self {
        let m = m.max(2);
        Self {
            metric,
            m,
            m0: m * 2,
            ef_construction: ef_construction.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            nodes: Vec::new(),
            entry_point: None,
            max_level: 0,
            tombstones: 0,
        }
    }

    /// Number of live (non-tombstoned) nodes.
    pub fn live_len(&self) -> usize {
        self.nodes.len() - self.tombstones
    }

    pub fn needs_compaction(&self) -> bool {
        self.tombstones > 0 && self.tombstones * 2 > self.nodes.len()
    }

    pub fn key(&self, slot: usize) -> &str {
        &self.nodes[slot].key
    }

    pub fn vector(&self, slot: usize) -> &[f32] {
        &self.nodes[slot].vector
    }

    /// Distance under the graph metric; smaller means closer.
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
            DistanceMetric::InnerProduct => -dot_product(a, b),
            DistanceMetric::Euclidean => euclidean_distance(a, b),
        }
    }

    fn level_for(&self, key: &str) -> usize {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        let bits = u64::from_le_bytes(bytes) >> 11;
        let uniform = (bits as f64 + 1.0) / (1u64 << 53) as f64;
        ((-uniform.ln() * self.level_mult).floor() as usize).min(MAX_LEVEL)
    }

    fn capacity(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    /// Insert a vector and return its slot.
    pub fn insert(&mut self, key: &str, vector: Vec<f32>) -> usize {
        let level = self.level_for(key);
        let slot = self.nodes.len();
        self.nodes.push(Node {
            key: key.to_string(),
            vector,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });

        let Some(mut entry) = self.entry_point else {
            self.entry_point = Some(slot);
            self.max_level = level;
            return slot;
        };

        let query = self.nodes[slot].vector.clone();
        for layer in (level + 1..=self.max_level).rev() {
            entry = self.greedy_closest(&query, entry, layer);
        }

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&query, &[entry], self.ef_construction, layer, |_| true);
            let cap = self.capacity(layer);
            let chosen: Vec<usize> = found
                .iter()
                .filter(|c| c.slot != slot && !self.nodes[c.slot].deleted)
                .take(cap)
                .map(|c| c.slot)
                .collect();

            self.nodes[slot].neighbors[layer] = chosen.clone();
            for &other in &chosen {
                self.nodes[other].neighbors[layer].push(slot);
                if self.nodes[other].neighbors[layer].len() > cap {
                    self.prune(other, layer, cap);
                }
            }
            if let Some(best) = found.first() {
                entry = best.slot;
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(slot);
        }
        slot
    }

    /// Tombstone a slot. Returns false when it was already removed.
    pub fn remove(&mut self, slot: usize) -> bool {
        match self.nodes.get_mut(slot) {
            Some(node) if !node.deleted => {
                node.deleted = true;
                self.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    /// Approximate k-nearest live nodes accepted by `accept`, closest first.
    pub fn search<F>(&self, query: &[f32], k: usize, ef: usize, accept: F) -> Vec<Candidate>
    where
        F: Fn(usize) -> bool,
    {
        let Some(mut entry) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 {
            return Vec::new();
        }
        for layer in (1..=self.max_level).rev() {
            entry = self.greedy_closest(query, entry, layer);
        }
        let mut found = self.search_layer(query, &[entry], ef.max(k), 0, |slot| {
            !self.nodes[slot].deleted && accept(slot)
        });
        found.truncate(k);
        found
    }

    fn greedy_closest(&self, query: &[f32], start: usize, layer: usize) -> usize {
        let mut best = start;
        let mut best_dist = self.distance(query, &self.nodes[best].vector);
        loop {
            let mut changed = false;
            if let Some(neighbors) = self.nodes[best].neighbors.get(layer) {
                for &n in neighbors {
                    let d = self.distance(query, &self.nodes[n].vector);
                    if d < best_dist {
                        best_dist = d;
                        best = n;
                        changed = true;
                    }
                }
            }
            if !changed {
                return best;
            }
        }
    }

    /// Beam search on one layer. Every node is traversed, but only nodes
    /// passing `accept` enter the result set. Results are closest first.
    fn search_layer<F>(
        &self,
        query: &[f32],
        entries: &[usize],
        ef: usize,
        layer: usize,
        accept: F,
    ) -> Vec<Candidate>
    where
        F: Fn(usize) -> bool,
    {
        let mut visited: HashSet<usize> = HashSet::new();
        let mut frontier: BinaryHeap<Reverse<Candidate>> = BinaryHeap::new();
        let mut results: BinaryHeap<Candidate> = BinaryHeap::new();

        for &e in entries {
            if visited.insert(e) {
                let c = Candidate {
                    dist: self.distance(query, &self.nodes[e].vector),
                    slot: e,
                };
                frontier.push(Reverse(c));
                if accept(e) {
                    results.push(c);
                }
            }
        }

        while let Some(Reverse(current)) = frontier.pop() {
            if results.len() >= ef {
                if let Some(worst) = results.peek() {
                    if current.dist > worst.dist {
                        break;
                    }
                }
            }
            let Some(neighbors) = self.nodes[current.slot].neighbors.get(layer) else {
                continue;
            };
            for &n in neighbors {
                if !visited.insert(n) {
                    continue;
                }
                let c = Candidate {
                    dist: self.distance(query, &self.nodes[n].vector),
                    slot: n,
                };
                let worst = results.peek().map(|w| w.dist).unwrap_or(f32::INFINITY);
                if results.len() < ef || c.dist < worst {
                    frontier.push(Reverse(c));
                    if accept(n) {
                        results.push(c);
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        results.into_sorted_vec()
    }

    fn prune(&mut self, slot: usize, layer: usize, cap: usize) {
        let base = &self.nodes[slot].vector;
        let mut scored: Vec<Candidate> = self.nodes[slot].neighbors[layer]
            .iter()
            .filter(|&&n| !self.nodes[n].deleted)
            .map(|&n| Candidate {
                dist: self.distance(base, &self.nodes[n].vector),
                slot: n,
            })
            .collect();
        scored.sort();
        scored.dedup_by_key(|c| c.slot);
        scored.truncate(cap);
        self.nodes[slot].neighbors[layer] = scored.into_iter().map(|c| c.slot).collect();
    }
}
