//! Error types for the snippet indexing service.
//!
//! Structured errors using thiserror, one enum per subsystem, translated at
//! component boundaries into the service-level taxonomy: transient provider
//! failures (retryable with backoff), invalid input (rejected, never
//! retried), stale events (acknowledged as no-ops by the pipeline), and
//! query timeouts (retryable, never partial results).

use std::time::Duration;
use thiserror::Error;

use crate::types::{ModelId, SnippetId};

/// Errors from the embedding provider boundary.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Embedding provider unavailable: {0}\nSuggestion: Check network connectivity and provider credentials, then retry")]
    ProviderUnavailable(String),

    #[error("Embedding provider rate limited the request\nSuggestion: Retry with backoff; reduce ingest concurrency if this persists")]
    RateLimited,

    #[error("Invalid embedding input: {0}")]
    InvalidInput(String),

    #[error(
        "Embedding dimension mismatch: expected {expected}, got {actual}\nSuggestion: Ensure query and index use the same embedding model"
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Failed to initialize embedding model: {0}\nSuggestion: First use downloads the model; check internet access and the cache directory")]
    ModelInit(String),
}

impl EmbeddingError {
    /// Whether a retry with backoff can reasonably succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderUnavailable(_) | Self::RateLimited)
    }
}

/// Errors from the vector store boundary.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Vector store is closed\nSuggestion: The store lifecycle ended; open a new store handle")]
    Closed,

    #[error("Invalid score value: {0}\nSuggestion: Scores must be finite and within [0.0, 1.0]")]
    InvalidScore(f32),

    #[error("Vector store unavailable: {0}")]
    Unavailable(String),

    #[error(
        "Index entries for snippet '{snippet_id}' mix content versions\nSuggestion: Re-ingest the snippet to restore a single live version"
    )]
    Inconsistent { snippet_id: SnippetId },

    #[error(
        "Entry model '{entry}' does not match index model '{index}'\nSuggestion: Re-embed the snippet with the current model"
    )]
    ModelMismatch { entry: ModelId, index: ModelId },

    #[error(
        "Entry vector has {actual} dimensions but its model tag declares {expected}\nSuggestion: The embedding was corrupted in transit; re-ingest the snippet"
    )]
    EntryDimension { expected: usize, actual: usize },
}

/// Errors terminating an ingestion attempt.
///
/// Stale or unchanged replays are not errors; the pipeline acknowledges
/// them as no-op outcomes (see `ingest::IngestOutcome`).
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Invalid ingestion event: {0}")]
    InvalidEvent(String),

    #[error(
        "Snippet '{snippet_id}' content is {size} bytes, over the {limit} byte limit"
    )]
    ContentTooLarge {
        snippet_id: SnippetId,
        size: usize,
        limit: usize,
    },

    #[error("Ingestion queue is full\nSuggestion: The pipeline is saturated; retry the trigger after a short delay")]
    QueueFull,

    #[error("Ingestion pipeline is shut down")]
    Shutdown,

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors surfaced to query callers.
///
/// Distinct from "zero results": an empty index yields `Ok(vec![])`.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Query text must not be empty")]
    InvalidQuery,

    #[error("Query timed out after {elapsed:?}\nSuggestion: This failure is retryable; partial results are never returned")]
    Timeout { elapsed: Duration },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    /// Stable identifier for wire responses, so callers can branch on the
    /// failure kind without parsing the message.
    #[must_use]
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::InvalidQuery => "INVALID_QUERY",
            Self::Timeout { .. } => "QUERY_TIMEOUT",
            Self::Embedding(e) if e.is_transient() => "PROVIDER_TRANSIENT",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }
}

impl IngestError {
    #[must_use]
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "INVALID_EVENT",
            Self::ContentTooLarge { .. } => "CONTENT_TOO_LARGE",
            Self::QueueFull => "QUEUE_FULL",
            Self::Shutdown => "PIPELINE_SHUTDOWN",
            Self::Embedding(e) if e.is_transient() => "PROVIDER_TRANSIENT",
            Self::Embedding(_) => "EMBEDDING_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Whether redelivering the triggering event can succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Embedding(e) => e.is_transient(),
            Self::Store(StoreError::Unavailable(_)) | Self::QueueFull => true,
            _ => false,
        }
    }
}

/// Result alias for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Result alias for vector store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result alias for ingestion operations.
pub type IngestResult<T> = Result<T, IngestError>;

/// Result alias for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(EmbeddingError::RateLimited.is_transient());
        assert!(EmbeddingError::ProviderUnavailable("dns".into()).is_transient());
        assert!(!EmbeddingError::InvalidInput("empty batch".into()).is_transient());
    }

    #[test]
    fn ingest_retryability() {
        assert!(IngestError::QueueFull.is_retryable());
        assert!(IngestError::Embedding(EmbeddingError::RateLimited).is_retryable());
        assert!(!IngestError::InvalidEvent("no id".into()).is_retryable());
    }

    #[test]
    fn query_status_codes_are_distinct() {
        let timeout = QueryError::Timeout {
            elapsed: Duration::from_secs(5),
        };
        assert_eq!(timeout.status_code(), "QUERY_TIMEOUT");
        assert_eq!(QueryError::InvalidQuery.status_code(), "INVALID_QUERY");
    }
}
