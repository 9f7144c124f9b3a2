//! Keyword retrieval: BM25 scoring over chunk text, plus reciprocal rank
//! fusion for combining ranked lists.
//!
//! # Tokenization
//!
//! Text is lowercased and split into runs of alphanumeric characters.
//! CJK ideographs and kana carry no spaces between words, so each one is
//! emitted as a token of its own.
//!
//! # Scoring
//!
//! Okapi BM25 with `k1 = 1.5`, `b = 0.75` and the non-negative idf
//! `ln(1 + (N - n + 0.5) / (n + 0.5))`. Chunks that share no term with the
//! query score zero and are never returned.

use std::collections::HashMap;

pub const BM25_K1: f64 = 1.5;
pub const BM25_B: f64 = 0.75;

/// Rank offset in reciprocal rank fusion.
pub const RRF_K: f64 = 60.0;

/// Scores at or below this are treated as no match.
const MIN_SCORE: f64 = 1e-12;

/// Split `text` into lowercase search terms.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in text.chars() {
        if is_cjk(ch) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            tokens.push(ch.to_string());
        } else if ch.is_alphanumeric() {
            word.extend(ch.to_lowercase());
        } else if !word.is_empty() {
            tokens.push(std::mem::take(&mut word));
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    tokens
}

fn is_cjk(ch: char) -> bool {
    matches!(ch,
        '\u{3040}'..='\u{30FF}'   // hiragana, katakana
        | '\u{3400}'..='\u{4DBF}' // CJK extension A
        | '\u{4E00}'..='\u{9FFF}' // CJK unified ideographs
        | '\u{AC00}'..='\u{D7AF}' // hangul syllables
        | '\u{F900}'..='\u{FAFF}')
}

/// A BM25 index over a fixed set of texts.
pub struct Bm25 {
    docs: Vec<HashMap<String, usize>>,
    lengths: Vec<usize>,
    avg_len: f64,
    doc_freq: HashMap<String, usize>,
}

impl Bm25 {
    pub fn new<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut docs = Vec::new();
        let mut lengths = Vec::new();
        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for text in texts {
            let tokens = tokenize(text);
            lengths.push(tokens.len());
            let mut tf: HashMap<String, usize> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_default() += 1;
            }
            for term in tf.keys() {
                *doc_freq.entry(term.clone()).or_default() += 1;
            }
            docs.push(tf);
        }
        let total: usize = lengths.iter().sum();
        let avg_len = if docs.is_empty() {
            0.0
        } else {
            total as f64 / docs.len() as f64
        };
        Self {
            docs,
            lengths,
            avg_len,
            doc_freq,
        }
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        let total = self.docs.len() as f64;
        (1.0 + (total - n + 0.5) / (n + 0.5)).ln()
    }

    /// One score per indexed text, in insertion order.
    pub fn scores(&self, query: &str) -> Vec<f64> {
        let mut terms = tokenize(query);
        terms.sort();
        terms.dedup();

        let avg_len = self.avg_len.max(1.0);
        self.docs
            .iter()
            .zip(&self.lengths)
            .map(|(tf, &len)| {
                terms
                    .iter()
                    .filter_map(|term| tf.get(term).map(|&f| (term, f as f64)))
                    .map(|(term, f)| {
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len as f64 / avg_len);
                        self.idf(term) * f * (BM25_K1 + 1.0) / (f + norm)
                    })
                    .sum()
            })
            .collect()
    }

    /// Indices of the `k` best-scoring texts with their scores, best first.
    /// Texts with no query term are left out; ties keep insertion order.
    pub fn top_k(&self, query: &str, k: usize) -> Vec<(usize, f64)> {
        let mut ranked: Vec<(usize, f64)> = self
            .scores(query)
            .into_iter()
            .enumerate()
            .filter(|(_, score)| *score > MIN_SCORE)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.truncate(k);
        ranked
    }
}

/// Fuse ranked lists of ids: each id scores `Σ weight / (RRF_K + rank)` over
/// the lists it appears in, with 1-based ranks. Best first; ties are broken
/// by id.
pub fn reciprocal_rank_fusion(lists: &[(&[String], f64)]) -> Vec<(String, f64)> {
    let mut fused: HashMap<&str, f64> = HashMap::new();
    for (ids, weight) in lists {
        for (rank, id) in ids.iter().enumerate() {
            *fused.entry(id.as_str()).or_default() += weight / (RRF_K + rank as f64 + 1.0);
        }
    }
    let mut ranked: Vec<(String, f64)> = fused
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
}
