//! Vector store abstraction and entry types.
//!
//! The store is an owned, injectable dependency with an explicit lifecycle
//! (constructed, injected, closed), never a process-wide singleton. Queries
//! score entries by cosine similarity and silently exclude entries whose
//! model identity does not match the query vector's; a mixed-model index
//! never produces garbage scores.
//!
//! # Version visibility
//!
//! The pipeline inserts new-version entries before purging superseded ones,
//! so two versions of a snippet may briefly coexist in storage. Queries
//! resolve this by only considering each snippet's highest live content
//! version: a reader never observes a mix of old and new chunks, and a
//! snippet that previously had entries never appears empty mid-swap. The
//! per-snippet version marker the coordinator reads is derived from the
//! same entries, so there is no second source of truth to drift.

mod memory;

pub use memory::MemoryVectorStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::types::{ChunkIndex, ContentHash, ContentVersion, ModelId, Score, SnippetId, TextSpan};

/// One chunk-level record in the vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub snippet_id: SnippetId,
    pub chunk_index: ChunkIndex,
    pub version: ContentVersion,
    pub content_hash: ContentHash,
    pub model: ModelId,
    pub vector: Vec<f32>,
    pub span: TextSpan,
    pub text: String,
    pub language: Option<String>,
    pub indexed_at: DateTime<Utc>,
}

/// Metadata predicate applied before similarity scoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataFilter {
    /// Restrict to snippets with this language tag.
    pub language: Option<String>,
}

impl MetadataFilter {
    #[must_use]
    pub fn matches(&self, entry: &IndexEntry) -> bool {
        match &self.language {
            Some(lang) => entry
                .language
                .as_deref()
                .is_some_and(|l| l.eq_ignore_ascii_case(lang)),
            None => true,
        }
    }
}

/// Datastore supporting nearest-neighbor search over vectors plus metadata
/// filtering.
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces entries keyed by (snippet id, version, chunk index).
    fn upsert(&self, entries: Vec<IndexEntry>) -> StoreResult<()>;

    /// Purges entries of `snippet_id` strictly older than `version`.
    /// Returns the number of entries removed.
    fn delete_older_than(&self, snippet_id: &SnippetId, version: ContentVersion)
    -> StoreResult<usize>;

    /// Removes all entries for a snippet. Returns the number removed.
    fn delete_snippet(&self, snippet_id: &SnippetId) -> StoreResult<usize>;

    /// Returns up to `top_k` chunk-level matches ordered by descending
    /// score. Entries tagged with a different model identity than `model`
    /// are excluded rather than scored.
    fn query(
        &self,
        vector: &[f32],
        model: &ModelId,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> StoreResult<Vec<(IndexEntry, Score)>>;

    /// Highest live content version and hash for a snippet, if indexed.
    /// This is the consistency coordinator's redelivery-detection read.
    fn current_version(&self, snippet_id: &SnippetId)
    -> StoreResult<Option<(ContentVersion, ContentHash)>>;

    /// Number of live index entries (latest versions only).
    fn entry_count(&self) -> StoreResult<usize>;

    /// Cheap non-mutating liveness probe for the health surface.
    fn ping(&self) -> StoreResult<()>;

    /// Ends the store lifecycle; subsequent operations fail with `Closed`.
    fn close(&self) -> StoreResult<()>;
}

/// Cosine similarity between two equal-length vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
