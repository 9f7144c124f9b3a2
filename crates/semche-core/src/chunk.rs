//! Recursive, overlapping text chunker.
//!
//! Splits document text into chunks of at most `chunk_size` characters,
//! carrying up to `chunk_overlap` characters of trailing context from one
//! chunk into the next. Sizes are counted in `char`s, never bytes.
//!
//! # Algorithm
//!
//! 1. Pick the first separator that occurs in the text (`""` always
//!    matches and splits into single characters).
//! 2. Split on it, keeping the separator at the start of the following
//!    piece so that pieces stay contiguous slices of the source.
//! 3. Pieces shorter than `chunk_size` are collected; longer ones are split
//!    again with the remaining separators, or kept whole when none remain.
//! 4. Collected pieces are merged greedily up to `chunk_size`. When a chunk
//!    is emitted, pieces are dropped from its front until at most
//!    `chunk_overlap` characters remain; those seed the next chunk.
//! 5. Each chunk is trimmed of surrounding whitespace; empty chunks vanish.
//!
//! # Example
//!
//! ```rust
//! use semche_core::chunk::{split_text, ChunkOptions};
//!
//! let opts = ChunkOptions::default();
//! let chunks = split_text(&"A".repeat(1500), &opts).unwrap();
//! assert_eq!(chunks.len(), 2);
//! assert_eq!(chunks[0].len(), 1000);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{chunk_id, Chunk, Metadata, MetadataValue};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Separators tried when no language preset applies.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", " ", ""];

const TYPESCRIPT_SEPARATORS: &[&str] = &[
    "\n\nclass ",
    "\n\nfunction ",
    "\n\nexport ",
    "\n\n",
    "\n",
    " ",
    "",
];
const PYTHON_SEPARATORS: &[&str] = &["\n\nclass ", "\n\ndef ", "\n\n", "\n", " ", ""];
const RUST_SEPARATORS: &[&str] = &[
    "\n\nimpl ",
    "\n\npub fn ",
    "\n\nfn ",
    "\n\nstruct ",
    "\n\nenum ",
    "\n\n",
    "\n",
    " ",
    "",
];

/// Separator preset for a language, if one exists.
pub fn separators_for_language(language: &str) -> Option<&'static [&'static str]> {
    match language.to_ascii_lowercase().as_str() {
        "typescript" | "ts" | "tsx" | "javascript" | "js" | "jsx" => Some(TYPESCRIPT_SEPARATORS),
        "python" | "py" => Some(PYTHON_SEPARATORS),
        "rust" | "rs" => Some(RUST_SEPARATORS),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkOptions {
    /// Maximum characters per chunk.
    pub chunk_size: usize,
    /// Characters of trailing context carried into the next chunk.
    pub chunk_overlap: usize,
    /// Candidate boundaries, most preferred first.
    pub separators: Vec<String>,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ChunkOptions {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be > 0".into()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// A contiguous slice of the source text, by byte offsets.
#[derive(Debug, Clone, Copy)]
struct Piece {
    start: usize,
    end: usize,
    chars: usize,
}

/// Split `text` into overlapping chunks.
pub fn split_text(text: &str, options: &ChunkOptions) -> Result<Vec<String>> {
    let separators: Vec<&str> = options.separators.iter().map(String::as_str).collect();
    split_with(text, &separators, options)
}

/// Split source code using the separator preset for `language`.
///
/// Unknown languages fall back to [`DEFAULT_SEPARATORS`].
pub fn split_for_language(code: &str, language: &str, options: &ChunkOptions) -> Result<Vec<String>> {
    let separators = separators_for_language(language).unwrap_or(DEFAULT_SEPARATORS);
    split_with(code, separators, options)
}

fn split_with(text: &str, separators: &[&str], options: &ChunkOptions) -> Result<Vec<String>> {
    options.validate()?;
    if text.is_empty() {
        return Ok(Vec::new());
    }
    let root = Piece {
        start: 0,
        end: text.len(),
        chars: text.chars().count(),
    };
    let mut out = Vec::new();
    split_recursive(text, root, separators, options, &mut out);
    Ok(out)
}

fn split_recursive(
    text: &str,
    span: Piece,
    separators: &[&str],
    options: &ChunkOptions,
    out: &mut Vec<String>,
) {
    let slice = &text[span.start..span.end];

    let mut separator = separators.last().copied().unwrap_or("");
    let mut remaining: Option<&[&str]> = None;
    for (i, sep) in separators.iter().enumerate() {
        if sep.is_empty() {
            separator = sep;
            break;
        }
        if slice.contains(sep) {
            separator = sep;
            remaining = Some(&separators[i + 1..]);
            break;
        }
    }

    let mut good: Vec<Piece> = Vec::new();
    for piece in split_on(text, span, separator) {
        if piece.chars < options.chunk_size {
            good.push(piece);
            continue;
        }
        if !good.is_empty() {
            merge_pieces(text, &good, options, out);
            good.clear();
        }
        match remaining {
            Some(rest) if !rest.is_empty() => split_recursive(text, piece, rest, options, out),
            _ => push_trimmed(&text[piece.start..piece.end], out),
        }
    }
    if !good.is_empty() {
        merge_pieces(text, &good, options, out);
    }
}

/// Split `span` on `separator`, keeping each separator at the head of the
/// piece that follows it. Empty pieces are dropped.
fn split_on(text: &str, span: Piece, separator: &str) -> Vec<Piece> {
    let slice = &text[span.start..span.end];
    let mut pieces = Vec::new();

    if separator.is_empty() {
        for (offset, ch) in slice.char_indices() {
            let start = span.start + offset;
            pieces.push(Piece {
                start,
                end: start + ch.len_utf8(),
                chars: 1,
            });
        }
        return pieces;
    }

    let mut cursor = 0;
    for (offset, _) in slice.match_indices(separator) {
        if offset > cursor {
            pieces.push(make_piece(text, span.start + cursor, span.start + offset));
        }
        cursor = offset;
    }
    if cursor < slice.len() {
        pieces.push(make_piece(text, span.start + cursor, span.end));
    }
    pieces
}

fn make_piece(text: &str, start: usize, end: usize) -> Piece {
    Piece {
        start,
        end,
        chars: text[start..end].chars().count(),
    }
}

fn merge_pieces(text: &str, pieces: &[Piece], options: &ChunkOptions, out: &mut Vec<String>) {
    let mut window: std::collections::VecDeque<Piece> = std::collections::VecDeque::new();
    let mut total = 0usize;

    for &piece in pieces {
        if total + piece.chars > options.chunk_size && !window.is_empty() {
            emit(text, &window, out);
            while total > options.chunk_overlap
                || (total + piece.chars > options.chunk_size && total > 0)
            {
                match window.pop_front() {
                    Some(dropped) => total -= dropped.chars,
                    None => break,
                }
            }
        }
        window.push_back(piece);
        total += piece.chars;
    }
    if !window.is_empty() {
        emit(text, &window, out);
    }
}

fn emit(text: &str, window: &std::collections::VecDeque<Piece>, out: &mut Vec<String>) {
    if let (Some(first), Some(last)) = (window.front(), window.back()) {
        push_trimmed(&text[first.start..last.end], out);
    }
}

fn push_trimmed(chunk: &str, out: &mut Vec<String>) {
    let trimmed = chunk.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

/// Chunk a document's content into [`Chunk`]s with deterministic ids.
///
/// The `language` metadata field selects a separator preset when one
/// exists and the caller kept the default separators. Chunk metadata is the
/// document metadata plus `documentId` and `chunkIndex`.
pub fn chunk_document(
    document_id: &str,
    content: &str,
    metadata: &Metadata,
    options: &ChunkOptions,
) -> Result<Vec<Chunk>> {
    let uses_default_separators = options
        .separators
        .iter()
        .map(String::as_str)
        .eq(DEFAULT_SEPARATORS.iter().copied());
    let texts = match metadata.language.as_deref() {
        Some(lang) if uses_default_separators && separators_for_language(lang).is_some() => {
            split_for_language(content, lang, options)?
        }
        _ => split_text(content, options)?,
    };

    Ok(texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| make_chunk(document_id, index, text, metadata))
        .collect())
}

/// SHA-256 hex digest of a chunk's text.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn make_chunk(document_id: &str, index: usize, text: String, metadata: &Metadata) -> Chunk {
    let mut chunk_meta = metadata.clone();
    chunk_meta
        .extra
        .insert("documentId".into(), MetadataValue::from(document_id));
    chunk_meta
        .extra
        .insert("chunkIndex".into(), MetadataValue::Int(index as i64));

    Chunk {
        id: chunk_id(document_id, index),
        document_id: document_id.to_string(),
        chunk_index: index,
        hash: content_hash(&text),
        text,
        metadata: chunk_meta,
    }
}
