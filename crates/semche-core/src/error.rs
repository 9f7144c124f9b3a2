//! Error taxonomy for the indexing engine.
//!
//! Every surfaced error names the operation and, where one exists, the
//! document or chunk it concerns, so callers can decide whether a retry is
//! worthwhile. Provider errors carry an explicit `retryable` flag.

use thiserror::Error;

/// Result alias used throughout `semche-core`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid configuration (startup settings or chunker options).
    #[error("configuration error: {0}")]
    Config(String),

    /// A caller argument was rejected before any work was done.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// A non-upsert index request named an id that is already stored.
    #[error("document '{0}' already exists (use upsert to replace it)")]
    DuplicateDocument(String),

    /// The persisted collection disagrees with the requested space.
    #[error(
        "collection '{collection}' is incompatible: stored {stored}, requested {requested}"
    )]
    IncompatibleCollection {
        collection: String,
        stored: String,
        requested: String,
    },

    /// The embedding backend failed.
    #[error("embedding provider failed during {operation}: {message}")]
    EmbeddingProvider {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// A mutation of the vector index failed.
    #[error("index write failed during {operation} (id '{id}'): {message}")]
    IndexWrite {
        operation: String,
        id: String,
        message: String,
    },

    /// A read of the vector index failed.
    #[error("index query failed: {0}")]
    IndexQuery(String),
}

impl Error {
    pub fn embedding(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::EmbeddingProvider {
            operation: operation.into(),
            message: message.to_string(),
            retryable: false,
        }
    }

    /// A provider failure that is worth retrying (rate limits, 5xx, network).
    pub fn transient_embedding(operation: impl Into<String>, message: impl ToString) -> Self {
        Error::EmbeddingProvider {
            operation: operation.into(),
            message: message.to_string(),
            retryable: true,
        }
    }

    pub fn index_write(
        operation: impl Into<String>,
        id: impl Into<String>,
        message: impl ToString,
    ) -> Self {
        Error::IndexWrite {
            operation: operation.into(),
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::EmbeddingProvider {
                retryable: true,
                ..
            }
        )
    }

    /// Short machine-readable kind, used in tool responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "ConfigError",
            Error::Validation(_) => "ValidationError",
            Error::DuplicateDocument(_) => "DuplicateDocumentError",
            Error::IncompatibleCollection { .. } => "IncompatibleCollectionError",
            Error::EmbeddingProvider { .. } => "EmbeddingProviderError",
            Error::IndexWrite { .. } => "IndexWriteError",
            Error::IndexQuery(_) => "IndexQueryError",
        }
    }
}
