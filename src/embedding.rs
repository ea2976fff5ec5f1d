//! Embedding provider adapter.
//!
//! Converts ordered batches of text into fixed-dimension vectors, tagging
//! every output with the model identity so downstream consumers can detect
//! staleness after a model upgrade. The provider trait is synchronous like
//! the underlying fastembed model; async callers run it on the blocking
//! pool with their own timeout.

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{EmbeddingError, EmbeddingResult};
use crate::types::ModelId;

/// A vector tagged with the identity of the model that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: ModelId,
}

/// Trait for generating embeddings from text.
///
/// Implementations must be thread-safe, preserve input order, and return
/// exactly one embedding per input text.
pub trait EmbeddingProvider: Send + Sync {
    /// Generates embeddings for a batch of texts, order preserving.
    fn embed(&self, texts: &[&str]) -> EmbeddingResult<Vec<Embedding>>;

    /// Identity of the model producing the vectors.
    fn model_id(&self) -> ModelId;

    /// Output vector dimensionality.
    #[must_use]
    fn dimension(&self) -> usize {
        self.model_id().dimension
    }
}

/// Parses a configured model name into a fastembed model.
pub fn parse_embedding_model(name: &str) -> EmbeddingResult<EmbeddingModel> {
    match name {
        "AllMiniLML6V2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "AllMiniLML12V2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "BGESmallENV15" => Ok(EmbeddingModel::BGESmallENV15),
        other => Err(EmbeddingError::ModelInit(format!(
            "unsupported embedding model '{other}'. Supported: AllMiniLML6V2, AllMiniLML12V2, BGESmallENV15"
        ))),
    }
}

/// FastEmbed-backed provider (AllMiniLML6V2 by default, 384 dimensions).
pub struct FastEmbedProvider {
    model: Mutex<TextEmbedding>,
    id: ModelId,
}

impl FastEmbedProvider {
    /// Initializes the model, downloading it into `cache_dir` on first use.
    pub fn new(model_name: &str, cache_dir: &Path) -> EmbeddingResult<Self> {
        let model = parse_embedding_model(model_name)?;
        let mut text_model = TextEmbedding::try_new(
            InitOptions::new(model)
                .with_cache_dir(cache_dir.to_path_buf())
                .with_show_download_progress(false),
        )
        .map_err(|e| EmbeddingError::ModelInit(e.to_string()))?;

        // Probe the dimensionality instead of hardcoding it per model.
        let probe = text_model
            .embed(vec!["dimension probe"], None)
            .map_err(|e| EmbeddingError::ModelInit(e.to_string()))?;
        let dimension = probe
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::ModelInit("model produced no probe vector".into()))?
            .len();

        Ok(Self {
            model: Mutex::new(text_model),
            id: ModelId::new(model_name, dimension),
        })
    }
}

impl EmbeddingProvider for FastEmbedProvider {
    fn embed(&self, texts: &[&str]) -> EmbeddingResult<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();

        let vectors = self
            .model
            .lock()
            .map_err(|_| {
                EmbeddingError::ProviderUnavailable(
                    "embedding model lock poisoned by a panicked thread".to_string(),
                )
            })?
            .embed(owned, None)
            .map_err(|e| EmbeddingError::ProviderUnavailable(e.to_string()))?;

        let expected = self.id.dimension;
        let mut out = Vec::with_capacity(vectors.len());
        for vector in vectors {
            if vector.len() != expected {
                return Err(EmbeddingError::DimensionMismatch {
                    expected,
                    actual: vector.len(),
                });
            }
            out.push(Embedding {
                vector,
                model: self.id.clone(),
            });
        }
        Ok(out)
    }

    fn model_id(&self) -> ModelId {
        self.id.clone()
    }
}

/// Deterministic offline provider based on hashed token features.
///
/// Texts sharing tokens (after light stemming) land near each other in the
/// vector space, which is enough for ranking tests and for running the
/// service without network access. Embeddings are unit length, so cosine
/// similarity behaves like the real model's.
pub struct HashEmbedProvider {
    id: ModelId,
}

impl HashEmbedProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::with_dimension(384)
    }

    #[must_use]
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            id: ModelId::new("hash-embed", dimension.max(1)),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let dim = self.id.dimension;
        let mut vector = vec![0.0f32; dim];

        for token in tokens(text) {
            bump(&mut vector, &token, 1.0);
            // Character trigrams let morphological variants ("add"/"adds",
            // "number"/"numbers") share mass.
            let bytes = token.as_bytes();
            if bytes.len() > 3 {
                for window in bytes.windows(3) {
                    bump_bytes(&mut vector, window, 0.4);
                }
            }
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for HashEmbedProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| {
            let lower = t.to_ascii_lowercase();
            // Light stemming: plural / 3rd-person 's'.
            lower.strip_suffix('s').map(str::to_string).unwrap_or(lower)
        })
        .collect()
}

fn bump(vector: &mut [f32], token: &str, weight: f32) {
    bump_bytes(vector, token.as_bytes(), weight);
}

fn bump_bytes(vector: &mut [f32], data: &[u8], weight: f32) {
    // Sha256 keeps the bucket assignment stable across processes; the
    // std hasher is randomly keyed per run and would break determinism.
    let digest = Sha256::digest(data);
    let bucket = u64::from_le_bytes(digest[..8].try_into().expect("digest has 32 bytes"));
    let idx = (bucket % vector.len() as u64) as usize;
    vector[idx] += weight;
}

impl EmbeddingProvider for HashEmbedProvider {
    fn embed(&self, texts: &[&str]) -> EmbeddingResult<Vec<Embedding>> {
        Ok(texts
            .iter()
            .map(|t| Embedding {
                vector: self.embed_one(t),
                model: self.id.clone(),
            })
            .collect())
    }

    fn model_id(&self) -> ModelId {
        self.id.clone()
    }
}

/// Batching and bounded-retry wrapper around a provider.
///
/// Splits input into provider-sized batches and retries transient failures
/// with jittered exponential backoff. Non-transient failures (invalid
/// input, dimension mismatch) are returned immediately; indefinite retry is
/// the caller's redelivery mechanism, not this adapter's.
pub struct BatchedEmbedder {
    provider: std::sync::Arc<dyn EmbeddingProvider>,
    max_batch_size: usize,
    max_retries: u32,
}

impl BatchedEmbedder {
    #[must_use]
    pub fn new(
        provider: std::sync::Arc<dyn EmbeddingProvider>,
        max_batch_size: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            max_batch_size: max_batch_size.max(1),
            max_retries,
        }
    }

    #[must_use]
    pub fn model_id(&self) -> ModelId {
        self.provider.model_id()
    }

    /// Embeds all texts in order, batch by batch.
    pub fn embed_all(&self, texts: &[&str]) -> EmbeddingResult<Vec<Embedding>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.max_batch_size) {
            out.extend(self.embed_batch(batch)?);
        }
        Ok(out)
    }

    fn embed_batch(&self, batch: &[&str]) -> EmbeddingResult<Vec<Embedding>> {
        let mut attempt = 0;
        loop {
            match self.provider.embed(batch) {
                Ok(embeddings) => {
                    if embeddings.len() != batch.len() {
                        return Err(EmbeddingError::InvalidInput(format!(
                            "provider returned {} embeddings for {} texts",
                            embeddings.len(),
                            batch.len()
                        )));
                    }
                    return Ok(embeddings);
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    let backoff = backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max = self.max_retries,
                        delay_ms = backoff.as_millis() as u64,
                        "transient embedding failure, retrying: {e}"
                    );
                    std::thread::sleep(backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    use rand::Rng;
    let base = 100u64.saturating_mul(1 << attempt.min(6));
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn hash_provider_is_deterministic() {
        let provider = HashEmbedProvider::with_dimension(64);
        let a = provider.embed(&["def add(a,b): return a+b"]).unwrap();
        let b = provider.embed(&["def add(a,b): return a+b"]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn hash_provider_preserves_order_and_count() {
        let provider = HashEmbedProvider::with_dimension(64);
        let texts = ["first text", "second text", "third text"];
        let embeddings = provider.embed(&texts).unwrap();
        assert_eq!(embeddings.len(), 3);
        for e in &embeddings {
            assert_eq!(e.vector.len(), 64);
            assert_eq!(e.model, provider.model_id());
        }
        // Order preserved: re-embedding individually matches the batch.
        let solo = provider.embed(&["second text"]).unwrap();
        assert_eq!(solo[0], embeddings[1]);
    }

    #[test]
    fn hash_provider_honors_small_dimensions() {
        // Callers size the vector space to match their index entries, so
        // the provider must not silently widen a requested dimension.
        let provider = HashEmbedProvider::with_dimension(4);
        assert_eq!(provider.dimension(), 4);
        let e = provider.embed(&["def add(a,b): return a+b"]).unwrap();
        assert_eq!(e[0].vector.len(), 4);
        assert_eq!(e[0].model.dimension, 4);
    }

    #[test]
    fn hash_provider_embeddings_are_unit_length() {
        let provider = HashEmbedProvider::with_dimension(64);
        let e = provider.embed(&["some code here"]).unwrap();
        let norm: f32 = e[0].vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn related_texts_score_higher_than_unrelated() {
        let provider = HashEmbedProvider::with_dimension(128);
        let e = provider
            .embed(&[
                "function that adds two numbers",
                "def add(a,b): return a+b",
                "parse yaml configuration file",
            ])
            .unwrap();
        let related = cosine(&e[0].vector, &e[1].vector);
        let unrelated = cosine(&e[0].vector, &e[2].vector);
        assert!(
            related > unrelated,
            "expected add-query closer to add-snippet ({related} vs {unrelated})"
        );
    }

    struct FlakyProvider {
        inner: HashEmbedProvider,
        failures_left: AtomicU32,
    }

    impl EmbeddingProvider for FlakyProvider {
        fn embed(&self, texts: &[&str]) -> EmbeddingResult<Vec<Embedding>> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EmbeddingError::RateLimited);
            }
            self.inner.embed(texts)
        }

        fn model_id(&self) -> ModelId {
            self.inner.model_id()
        }
    }

    #[test]
    fn batched_embedder_retries_transient_failures() {
        let provider = Arc::new(FlakyProvider {
            inner: HashEmbedProvider::with_dimension(32),
            failures_left: AtomicU32::new(2),
        });
        let embedder = BatchedEmbedder::new(provider, 16, 3);
        let result = embedder.embed_all(&["hello world"]);
        assert!(result.is_ok());
    }

    #[test]
    fn batched_embedder_gives_up_after_bounded_attempts() {
        let provider = Arc::new(FlakyProvider {
            inner: HashEmbedProvider::with_dimension(32),
            failures_left: AtomicU32::new(100),
        });
        let embedder = BatchedEmbedder::new(provider, 16, 2);
        let result = embedder.embed_all(&["hello world"]);
        assert!(matches!(result, Err(EmbeddingError::RateLimited)));
    }

    #[test]
    #[ignore = "downloads the embedding model on first run"]
    fn fastembed_provider_embeds_real_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FastEmbedProvider::new("AllMiniLML6V2", dir.path()).unwrap();
        assert_eq!(provider.dimension(), 384);
        let embeddings = provider.embed(&["fn main() { println!(\"hi\"); }"]).unwrap();
        assert_eq!(embeddings[0].vector.len(), 384);
    }

    #[test]
    fn batched_embedder_splits_batches_in_order() {
        let provider = Arc::new(HashEmbedProvider::with_dimension(32));
        let embedder = BatchedEmbedder::new(provider.clone(), 2, 0);
        let texts = ["a one", "b two", "c three", "d four", "e five"];
        let batched = embedder.embed_all(&texts).unwrap();
        let direct = provider.embed(&texts).unwrap();
        assert_eq!(batched, direct);
    }
}
