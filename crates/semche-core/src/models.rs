//! Core data models: documents, chunks, metadata, and collection settings.
//!
//! Metadata has an open schema. Three fields are recognized and must be
//! strings (`filePath`, `language`, `projectName`); everything else lands in
//! an extension bag of scalar values and is passed through untouched.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between a document id and the chunk index in a chunk id.
pub const CHUNK_ID_SEPARATOR: &str = "::";

/// Build the deterministic id of the `index`-th chunk of `document_id`.
///
/// ```rust
/// assert_eq!(semche_core::models::chunk_id("doc1", 3), "doc1::3");
/// ```
pub fn chunk_id(document_id: &str, index: usize) -> String {
    format!("{document_id}{CHUNK_ID_SEPARATOR}{index}")
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl MetadataValue {
    /// Convert a JSON scalar. Arrays, objects, and null are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            serde_json::Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Value::from(*f),
            Self::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Document or chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(rename = "filePath", default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(rename = "projectName", default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Unrecognized fields, passed through opaquely.
    #[serde(flatten)]
    pub extra: BTreeMap<String, MetadataValue>,
}

impl Metadata {
    /// Parse a JSON object, validating recognized fields.
    ///
    /// `null` values are dropped; nested arrays/objects are rejected.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let obj = match value {
            serde_json::Value::Null => return Ok(Self::default()),
            serde_json::Value::Object(obj) => obj,
            other => {
                return Err(Error::Validation(format!(
                    "metadata must be an object, got {other}"
                )))
            }
        };

        let mut meta = Self::default();
        for (key, raw) in obj {
            if raw.is_null() {
                continue;
            }
            let value = MetadataValue::from_json(raw).ok_or_else(|| {
                Error::Validation(format!("metadata field '{key}' must be a scalar value"))
            })?;
            meta.set(key, value)?;
        }
        Ok(meta)
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut obj = serde_json::Map::new();
        for (key, value) in self.iter() {
            obj.insert(key.to_string(), value.to_json());
        }
        serde_json::Value::Object(obj)
    }

    /// Set a field, routing recognized keys to their typed slots.
    pub fn set(&mut self, key: &str, value: MetadataValue) -> Result<()> {
        let slot = match key {
            "filePath" => &mut self.file_path,
            "language" => &mut self.language,
            "projectName" => &mut self.project_name,
            _ => {
                self.extra.insert(key.to_string(), value);
                return Ok(());
            }
        };
        match value {
            MetadataValue::String(s) => {
                *slot = Some(s);
                Ok(())
            }
            other => Err(Error::Validation(format!(
                "metadata field '{key}' must be a string, got {}",
                other.to_json()
            ))),
        }
    }

    /// Look up a field by its wire name.
    pub fn get(&self, key: &str) -> Option<Cow<'_, MetadataValue>> {
        let typed = match key {
            "filePath" => &self.file_path,
            "language" => &self.language,
            "projectName" => &self.project_name,
            _ => return self.extra.get(key).map(Cow::Borrowed),
        };
        typed
            .as_ref()
            .map(|s| Cow::Owned(MetadataValue::String(s.clone())))
    }

    /// Iterate all fields by wire name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, MetadataValue)> + '_ {
        let typed = [
            ("filePath", &self.file_path),
            ("language", &self.language),
            ("projectName", &self.project_name),
        ];
        typed
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|s| (k, MetadataValue::String(s.clone()))))
            .chain(self.extra.iter().map(|(k, v)| (k.as_str(), v.clone())))
    }
}

/// A logical document and the chunk ids it currently owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub chunk_ids: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// A document as submitted for indexing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDocument {
    /// Caller-supplied id; a UUID v4 is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewDocument {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            id: None,
            content: content.into(),
            metadata: Metadata::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A chunk of a document's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    /// SHA-256 of `text`, used to skip re-embedding unchanged chunks.
    pub hash: String,
    pub metadata: Metadata,
}

/// A chunk together with its embedding vector, the unit stored in an index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// Similarity space of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    #[serde(rename = "cosine")]
    Cosine,
    #[serde(rename = "l2", alias = "euclidean")]
    Euclidean,
    #[serde(rename = "ip", alias = "inner_product")]
    InnerProduct,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Euclidean => "l2",
            Self::InnerProduct => "ip",
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DistanceMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "l2" | "euclidean" => Ok(Self::Euclidean),
            "ip" | "inner_product" | "dot" => Ok(Self::InnerProduct),
            other => Err(Error::Config(format!(
                "unknown distance metric '{other}' (expected cosine, l2, or ip)"
            ))),
        }
    }
}

/// Settings fixed when a collection is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionConfig {
    pub name: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    /// HNSW `ef_construction`: beam width while inserting.
    pub ef_construction: usize,
    /// HNSW `M`: neighbors kept per node on upper layers.
    pub m: usize,
    /// Beam width while querying. Tunable; not part of the stored space.
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
}

fn default_ef_search() -> usize {
    64
}

impl CollectionConfig {
    pub fn new(name: impl Into<String>, dimension: usize, metric: DistanceMetric) -> Self {
        Self {
            name: name.into(),
            dimension,
            metric,
            ef_construction: 100,
            m: 16,
            ef_search: default_ef_search(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("collection name must not be empty".into()));
        }
        if self.dimension == 0 {
            return Err(Error::Config("embedding dimension must be > 0".into()));
        }
        if self.ef_construction == 0 {
            return Err(Error::Config("hnsw ef_construction must be > 0".into()));
        }
        if self.m < 2 {
            return Err(Error::Config("hnsw M must be >= 2".into()));
        }
        if self.ef_search == 0 {
            return Err(Error::Config("hnsw ef_search must be > 0".into()));
        }
        Ok(())
    }

    /// Fail if `requested` would change the space of this (stored) collection.
    pub fn check_compatible(&self, requested: &CollectionConfig) -> Result<()> {
        if self.dimension != requested.dimension || self.metric != requested.metric {
            return Err(Error::IncompatibleCollection {
                collection: self.name.clone(),
                stored: format!("dimension={} metric={}", self.dimension, self.metric),
                requested: format!(
                    "dimension={} metric={}",
                    requested.dimension, requested.metric
                ),
            });
        }
        Ok(())
    }
}
