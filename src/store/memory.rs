//! In-memory vector store.
//!
//! Entries live in a `RwLock<HashMap>` keyed by snippet id. All writes for
//! one snippet happen under a single write-lock acquisition, so readers
//! observe per-snippet swaps atomically. Queries are exact nearest-neighbor
//! scans; at the scale of a snippet library this beats maintaining an
//! approximate index, and the trait leaves room for an ANN-backed store.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{StoreError, StoreResult};
use crate::store::{IndexEntry, MetadataFilter, VectorStore, cosine_similarity};
use crate::types::{ContentHash, ContentVersion, ModelId, Score, SnippetId};

#[derive(Default)]
pub struct MemoryVectorStore {
    entries: RwLock<HashMap<SnippetId, Vec<IndexEntry>>>,
    closed: AtomicBool,
}

impl MemoryVectorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn live_version(entries: &[IndexEntry]) -> Option<ContentVersion> {
        entries.iter().map(|e| e.version).max()
    }
}

impl VectorStore for MemoryVectorStore {
    fn upsert(&self, new_entries: Vec<IndexEntry>) -> StoreResult<()> {
        self.check_open()?;
        for entry in &new_entries {
            if entry.vector.len() != entry.model.dimension {
                return Err(StoreError::EntryDimension {
                    expected: entry.model.dimension,
                    actual: entry.vector.len(),
                });
            }
        }

        let mut map = self.entries.write();
        for entry in new_entries {
            let bucket = map.entry(entry.snippet_id.clone()).or_default();
            // Replace on identical (version, chunk index); duplicate
            // redeliveries must not duplicate entries.
            if let Some(existing) = bucket
                .iter_mut()
                .find(|e| e.version == entry.version && e.chunk_index == entry.chunk_index)
            {
                *existing = entry;
            } else {
                bucket.push(entry);
            }
        }
        Ok(())
    }

    fn delete_older_than(
        &self,
        snippet_id: &SnippetId,
        version: ContentVersion,
    ) -> StoreResult<usize> {
        self.check_open()?;
        let mut map = self.entries.write();
        let Some(bucket) = map.get_mut(snippet_id) else {
            return Ok(0);
        };
        let before = bucket.len();
        bucket.retain(|e| e.version >= version);
        let removed = before - bucket.len();
        if bucket.is_empty() {
            map.remove(snippet_id);
        }
        Ok(removed)
    }

    fn delete_snippet(&self, snippet_id: &SnippetId) -> StoreResult<usize> {
        self.check_open()?;
        Ok(self
            .entries
            .write()
            .remove(snippet_id)
            .map_or(0, |bucket| bucket.len()))
    }

    fn query(
        &self,
        vector: &[f32],
        model: &ModelId,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> StoreResult<Vec<(IndexEntry, Score)>> {
        self.check_open()?;
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let map = self.entries.read();
        let mut candidates: Vec<(IndexEntry, Score)> = Vec::new();
        for bucket in map.values() {
            // Only the highest live version of each snippet is visible, so
            // an in-flight insert-before-delete swap never exposes a mix of
            // versions to readers.
            let Some(live) = Self::live_version(bucket) else {
                continue;
            };
            for entry in bucket {
                if entry.version != live || &entry.model != model || !filter.matches(entry) {
                    continue;
                }
                let score = Score::from_cosine(cosine_similarity(vector, &entry.vector));
                candidates.push((entry.clone(), score));
            }
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    fn current_version(
        &self,
        snippet_id: &SnippetId,
    ) -> StoreResult<Option<(ContentVersion, ContentHash)>> {
        self.check_open()?;
        let map = self.entries.read();
        Ok(map.get(snippet_id).and_then(|bucket| {
            let live = Self::live_version(bucket)?;
            bucket
                .iter()
                .find(|e| e.version == live)
                .map(|e| (live, e.content_hash.clone()))
        }))
    }

    fn entry_count(&self) -> StoreResult<usize> {
        self.check_open()?;
        let map = self.entries.read();
        Ok(map
            .values()
            .map(|bucket| {
                let Some(live) = Self::live_version(bucket) else {
                    return 0;
                };
                bucket.iter().filter(|e| e.version == live).count()
            })
            .sum())
    }

    fn ping(&self) -> StoreResult<()> {
        self.check_open()?;
        // Touch the map read path without mutating anything.
        let _ = self.entries.read().len();
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
