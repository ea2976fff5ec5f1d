//! Core data model for the snippet index.
//!
//! Newtypes follow the project's strict type safety guidelines: identifiers,
//! versions, and scores are never bare primitives, so a chunk index cannot be
//! confused with a content version at a call site.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StoreError;

/// Identifier of a stored snippet.
///
/// Snippet ids come from the outside (blob names, API callers, agent tools),
/// so this is a validated string newtype rather than a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnippetId(String);

impl SnippetId {
    /// Creates a snippet id. Returns `None` for empty or whitespace-only input.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() { None } else { Some(Self(id)) }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SnippetId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position of a chunk within its parent snippet (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkIndex(pub u32);

impl ChunkIndex {
    #[must_use]
    pub const fn get(&self) -> u32 {
        self.0
    }
}

/// Monotonic marker distinguishing successive edits of the same snippet.
///
/// Derived from the event sequence assigned by the trigger transport; two
/// events for the same snippet always carry distinct versions, and a larger
/// version supersedes a smaller one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentVersion(pub u64);

impl ContentVersion {
    #[must_use]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContentVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// SHA-256 hash of snippet content, used for unchanged-content detection
/// when events are replayed with a fresh sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Hashes snippet content.
    #[must_use]
    pub fn of(content: &str) -> Self {
        let digest = Sha256::digest(content.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identity of the embedding model that produced a vector.
///
/// Vectors are only comparable within the same model identity; queries and
/// the store both use this tag to reject cross-model comparisons after a
/// model upgrade instead of producing garbage scores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub name: String,
    pub dimension: usize,
}

impl ModelId {
    #[must_use]
    pub fn new(name: impl Into<String>, dimension: usize) -> Self {
        Self {
            name: name.into(),
            dimension,
        }
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.dimension)
    }
}

/// Byte span into a snippet's content, attached to results as provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
}

impl TextSpan {
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A sub-span of a snippet's text sized for embedding.
///
/// Chunks are ephemeral: regenerated in full whenever the parent snippet
/// changes, never persisted apart from their vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub snippet_id: SnippetId,
    pub index: ChunkIndex,
    pub span: TextSpan,
    pub text: String,
}

/// Similarity score normalized to [0.0, 1.0], where 1.0 is a perfect match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Score(f32);

impl Score {
    /// Creates a score with validation. Rejects NaN and out-of-range values.
    pub fn new(value: f32) -> Result<Self, StoreError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(StoreError::InvalidScore(value));
        }
        Ok(Self(value))
    }

    /// Maps cosine similarity from [-1, 1] into a score, clamping tiny
    /// floating-point excursions outside the mathematical range.
    #[must_use]
    pub fn from_cosine(similarity: f32) -> Self {
        if similarity.is_nan() {
            return Self(0.0);
        }
        Self(((similarity + 1.0) / 2.0).clamp(0.0, 1.0))
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self(0.0)
    }

    #[must_use]
    pub fn get(&self) -> f32 {
        self.0
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0
            .partial_cmp(&other.0)
            .expect("Score values are validated against NaN")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_id_rejects_blank() {
        assert!(SnippetId::new("").is_none());
        assert!(SnippetId::new("   ").is_none());
        assert_eq!(SnippetId::new("utils.py").unwrap().as_str(), "utils.py");
    }

    #[test]
    fn content_hash_is_stable() {
        let a = ContentHash::of("def add(a,b): return a+b");
        let b = ContentHash::of("def add(a,b): return a+b");
        let c = ContentHash::of("def sub(a,b): return a-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn content_version_orders() {
        assert!(ContentVersion(2) > ContentVersion(1));
    }

    #[test]
    fn score_validation() {
        assert!(Score::new(0.5).is_ok());
        assert!(Score::new(-0.1).is_err());
        assert!(Score::new(1.1).is_err());
        assert!(Score::new(f32::NAN).is_err());
    }

    #[test]
    fn score_from_cosine_maps_range() {
        assert_eq!(Score::from_cosine(1.0).get(), 1.0);
        assert_eq!(Score::from_cosine(-1.0).get(), 0.0);
        assert!((Score::from_cosine(0.0).get() - 0.5).abs() < f32::EPSILON);
        // Floating noise just above 1.0 clamps instead of failing.
        assert_eq!(Score::from_cosine(1.000001).get(), 1.0);
    }
}
