//! Semantic code-snippet manager: vector indexing, retrieval, and agent tools.
//!
//! Snippets enter through ingestion events (HTTP calls, MCP tools, or the
//! CLI), are chunked and embedded, and land in a vector store where a query
//! engine serves semantic search over them. Re-ingesting the same content
//! is idempotent, new versions replace old ones atomically from a reader's
//! point of view, and the index never mixes vectors from different
//! embedding models.

pub mod chunking;
pub mod config;
pub mod embedding;
pub mod error;
pub mod ingest;
pub mod mcp;
pub mod query;
#[cfg(feature = "http-server")]
pub mod server;
pub mod store;
pub mod types;

// Explicit exports for better API clarity
pub use config::Settings;
pub use embedding::{
    BatchedEmbedder, Embedding, EmbeddingProvider, FastEmbedProvider, HashEmbedProvider,
};
pub use error::{
    EmbeddingError, EmbeddingResult, IngestError, IngestResult, QueryError, QueryResult,
    StoreError, StoreResult,
};
pub use ingest::{
    IngestHandle, IngestOutcome, IngestPipeline, NoOpReason, PipelineStatus, SequenceSource,
    SnippetEvent,
};
pub use query::{ChunkMatch, QueryEngine, ScoreAggregation, SearchHit};
pub use store::{IndexEntry, MemoryVectorStore, MetadataFilter, VectorStore};
pub use types::{
    Chunk, ChunkIndex, ContentHash, ContentVersion, ModelId, Score, SnippetId, TextSpan,
};
