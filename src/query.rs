//! Query engine: natural-language or code queries against the vector index.
//!
//! A query is embedded with the same model identity as the index, the store
//! is overfetched at chunk granularity, chunk hits are grouped into
//! snippet-level results under a configurable aggregation policy, and the
//! matched chunk spans ride along as provenance.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::QueryConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbeddingError, QueryError};
use crate::store::{IndexEntry, MetadataFilter, VectorStore};
use crate::types::{ChunkIndex, Score, SnippetId, TextSpan};

/// How multiple matching chunks of one snippet combine into its score.
///
/// Upstream left this unspecified; it is a configurable policy defaulting
/// to the maximum chunk score, which rewards one strongly matching chunk
/// over many weak ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScoreAggregation {
    /// Best single chunk wins.
    #[default]
    Max,
    /// Average over the snippet's matched chunks.
    Mean,
    /// Sum of the strongest N chunk scores, capped at 1.0.
    TopNSum(usize),
}

impl ScoreAggregation {
    fn aggregate(&self, mut scores: Vec<Score>) -> Score {
        scores.sort_by(|a, b| b.cmp(a));
        match self {
            Self::Max => scores.first().copied().unwrap_or(Score::zero()),
            Self::Mean => {
                if scores.is_empty() {
                    Score::zero()
                } else {
                    let sum: f32 = scores.iter().map(Score::get).sum();
                    Score::new((sum / scores.len() as f32).clamp(0.0, 1.0))
                        .unwrap_or(Score::zero())
                }
            }
            Self::TopNSum(n) => {
                let sum: f32 = scores.iter().take((*n).max(1)).map(Score::get).sum();
                Score::new(sum.clamp(0.0, 1.0)).unwrap_or(Score::zero())
            }
        }
    }
}

/// One matched chunk, attached to a result as provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMatch {
    pub chunk_index: ChunkIndex,
    pub span: TextSpan,
    pub score: Score,
    pub text: String,
}

/// Snippet-level search result, deduplicated across its chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub snippet_id: SnippetId,
    pub score: Score,
    pub language: Option<String>,
    /// Matched chunk spans, strongest first.
    pub matches: Vec<ChunkMatch>,
}

/// Read-only search front end over the vector store.
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: QueryConfig,
}

impl QueryEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        config: QueryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
        }
    }

    /// Searches the index. `top_k` defaults from configuration.
    ///
    /// An empty index yields `Ok(vec![])`; a blank query is rejected with
    /// `InvalidQuery`; an overrunning query fails with `Timeout` rather
    /// than returning partial results.
    pub async fn search(
        &self,
        query_text: &str,
        top_k: Option<usize>,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, QueryError> {
        let query_text = query_text.trim();
        if query_text.is_empty() {
            return Err(QueryError::InvalidQuery);
        }
        let top_k = top_k.unwrap_or(self.config.default_top_k).max(1);
        let budget = Duration::from_millis(self.config.timeout_ms);

        let this = self.clone();
        let text = query_text.to_string();
        let task_filter = filter.clone();
        match tokio::time::timeout(
            budget,
            async move { this.search_inner(&text, top_k, &task_filter).await },
        )
        .await
        {
            Ok(result) => result.map(|mut hits| {
                hits.truncate(top_k);
                hits
            }),
            Err(_) => Err(QueryError::Timeout { elapsed: budget }),
        }
    }

    async fn search_inner(
        &self,
        query_text: &str,
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>, QueryError> {
        let provider = Arc::clone(&self.provider);
        let text = query_text.to_string();
        let embedding = tokio::task::spawn_blocking(move || provider.embed(&[text.as_str()]))
            .await
            .map_err(|e| {
                QueryError::Embedding(EmbeddingError::ProviderUnavailable(format!(
                    "embedding task failed: {e}"
                )))
            })??
            .into_iter()
            .next()
            .ok_or_else(|| {
                QueryError::Embedding(EmbeddingError::InvalidInput(
                    "provider returned no embedding for the query".into(),
                ))
            })?;

        // Chunk-level overfetch: several chunks of one snippet may match,
        // and grouping must not starve lower-ranked snippets out of top_k.
        let overfetch = top_k.saturating_mul(self.config.overfetch_factor.max(1));
        let hits = self
            .store
            .query(&embedding.vector, &embedding.model, overfetch, filter)?;

        Ok(group_by_snippet(hits, self.config.aggregation))
    }
}

fn group_by_snippet(
    chunk_hits: Vec<(IndexEntry, Score)>,
    aggregation: ScoreAggregation,
) -> Vec<SearchHit> {
    let mut grouped: HashMap<SnippetId, Vec<(IndexEntry, Score)>> = HashMap::new();
    for (entry, score) in chunk_hits {
        grouped.entry(entry.snippet_id.clone()).or_default().push((entry, score));
    }

    let mut ranked: Vec<SearchHit> = grouped
        .into_iter()
        .map(|(snippet_id, mut entries)| {
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            let score = aggregation.aggregate(entries.iter().map(|(_, s)| *s).collect());
            let language = entries[0].0.language.clone();
            let matches = entries
                .into_iter()
                .map(|(entry, score)| ChunkMatch {
                    chunk_index: entry.chunk_index,
                    span: entry.span,
                    score,
                    text: entry.text,
                })
                .collect();
            SearchHit {
                snippet_id,
                score,
                language,
                matches,
            }
        })
        .collect();

    // Deterministic ordering: score descending, snippet id as tie-break.
    ranked.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.snippet_id.cmp(&b.snippet_id))
    });
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashEmbedProvider;
    use crate::store::MemoryVectorStore;
    use crate::types::{ContentHash, ContentVersion, ModelId};
    use chrono::Utc;

    fn entry(id: &str, chunk: u32, vector: Vec<f32>, language: Option<&str>) -> IndexEntry {
        IndexEntry {
            snippet_id: SnippetId::new(id).unwrap(),
            chunk_index: ChunkIndex(chunk),
            version: ContentVersion(1),
            content_hash: ContentHash::of(id),
            model: ModelId::new("hash-embed", 4),
            vector,
            span: TextSpan::new(0, 4),
            text: format!("{id}:{chunk}"),
            language: language.map(str::to_string),
            indexed_at: Utc::now(),
        }
    }

    fn engine_with(entries: Vec<IndexEntry>, aggregation: ScoreAggregation) -> QueryEngine {
        let store = Arc::new(MemoryVectorStore::new());
        store.upsert(entries).unwrap();
        let mut config = QueryConfig::default();
        config.aggregation = aggregation;
        QueryEngine::new(store, Arc::new(HashEmbedProvider::with_dimension(4)), config)
    }

    #[test]
    fn aggregation_max_takes_best_chunk() {
        let scores = vec![
            Score::new(0.4).unwrap(),
            Score::new(0.9).unwrap(),
            Score::new(0.2).unwrap(),
        ];
        assert_eq!(ScoreAggregation::Max.aggregate(scores.clone()).get(), 0.9);
        assert!((ScoreAggregation::Mean.aggregate(scores.clone()).get() - 0.5).abs() < 1e-6);
        assert!(
            (ScoreAggregation::TopNSum(2).aggregate(scores).get() - 1.0).abs() < 1e-6,
            "0.9 + 0.4 caps at 1.0"
        );
    }

    #[test]
    fn grouping_dedupes_at_snippet_level() {
        let hits = vec![
            (entry("a", 0, vec![1.0, 0.0, 0.0, 0.0], None), Score::new(0.9).unwrap()),
            (entry("a", 1, vec![0.9, 0.1, 0.0, 0.0], None), Score::new(0.7).unwrap()),
            (entry("b", 0, vec![0.0, 1.0, 0.0, 0.0], None), Score::new(0.8).unwrap()),
        ];
        let ranked = group_by_snippet(hits, ScoreAggregation::Max);
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].snippet_id.as_str(), "a");
        assert_eq!(ranked[0].matches.len(), 2);
        // Provenance ordered strongest-first.
        assert!(ranked[0].matches[0].score >= ranked[0].matches[1].score);
        assert_eq!(ranked[1].snippet_id.as_str(), "b");
    }

    #[tokio::test]
    async fn empty_query_is_invalid() {
        let engine = engine_with(vec![], ScoreAggregation::Max);
        let err = engine
            .search("   ", None, &MetadataFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::InvalidQuery));
    }

    #[tokio::test]
    async fn empty_index_returns_empty_ok() {
        let engine = engine_with(vec![], ScoreAggregation::Max);
        let hits = engine
            .search("anything at all", None, &MetadataFilter::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn identical_content_ranks_first_with_top_score() {
        let provider = HashEmbedProvider::with_dimension(4);
        let target = provider.embed(&["alpha beta gamma"]).unwrap().remove(0);
        let engine = engine_with(
            vec![
                entry("match", 0, target.vector, None),
                entry("other", 0, vec![0.0, 0.0, 0.0, 1.0], None),
            ],
            ScoreAggregation::Max,
        );
        let hits = engine
            .search("alpha beta gamma", Some(2), &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits[0].snippet_id.as_str(), "match");
        assert!((hits[0].score.get() - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn language_filter_restricts_results() {
        let provider = HashEmbedProvider::with_dimension(4);
        let v = provider.embed(&["shared text"]).unwrap().remove(0).vector;
        let engine = engine_with(
            vec![
                entry("py", 0, v.clone(), Some("python")),
                entry("rs", 0, v, Some("rust")),
            ],
            ScoreAggregation::Max,
        );
        let filter = MetadataFilter {
            language: Some("rust".into()),
        };
        let hits = engine.search("shared text", Some(5), &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].snippet_id.as_str(), "rs");
    }

    #[tokio::test]
    async fn truncates_to_top_k() {
        let provider = HashEmbedProvider::with_dimension(4);
        let v = provider.embed(&["payload"]).unwrap().remove(0).vector;
        let entries = (0..10)
            .map(|i| entry(&format!("s{i}"), 0, v.clone(), None))
            .collect();
        let engine = engine_with(entries, ScoreAggregation::Max);
        let hits = engine
            .search("payload", Some(3), &MetadataFilter::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
    }
}
