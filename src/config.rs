//! Configuration for the snippet indexing service.
//!
//! Layered configuration: defaults → `snipdex.toml` → environment
//! variables. Environment variables use the `SNIPDEX_` prefix with double
//! underscores for nesting:
//! - `SNIPDEX_INGEST__WORKERS=8` sets `ingest.workers`
//! - `SNIPDEX_QUERY__OVERFETCH_FACTOR=6` sets `query.overfetch_factor`
//! - `SNIPDEX_SERVER__BIND=0.0.0.0:3000` sets `server.bind`

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::query::ScoreAggregation;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Version of the configuration schema
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Global debug mode
    #[serde(default = "default_false")]
    pub debug: bool,

    /// Chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Query engine configuration
    #[serde(default)]
    pub query: QueryConfig,

    /// Server configuration (http / stdio agent transport)
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum chunk size in bytes before splitting
    #[serde(default = "default_max_chunk_bytes")]
    pub max_chunk_bytes: usize,

    /// Overlap carried between adjacent window-split chunks
    #[serde(default = "default_overlap_bytes")]
    pub overlap_bytes: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingConfig {
    /// Embedding model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Maximum texts per provider request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Bounded retry attempts for transient provider failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-call timeout in milliseconds
    #[serde(default = "default_embed_timeout_ms")]
    pub timeout_ms: u64,

    /// Cache directory for downloaded models (defaults to the user cache dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_cache_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IngestConfig {
    /// Number of parallel ingestion workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Bounded event queue capacity; triggers are rejected when full
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent embedding calls across all workers
    #[serde(default = "default_embed_concurrency")]
    pub embed_concurrency: usize,

    /// Redeliveries before an event is dead-lettered
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,

    /// Maximum snippet content size in bytes; larger events are skipped
    #[serde(default = "default_max_content_bytes")]
    pub max_content_bytes: usize,

    /// Language tags to exclude from indexing, compared case-insensitively
    #[serde(default)]
    pub skip_languages: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QueryConfig {
    /// Default number of results when the caller does not specify top_k
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Chunk-level overfetch multiplier to compensate for multi-chunk snippets
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,

    /// How multiple matching chunks of one snippet combine into its score
    #[serde(default)]
    pub aggregation: ScoreAggregation,

    /// Per-query timeout in milliseconds
    #[serde(default = "default_query_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Default server mode: "stdio" or "http"
    #[serde(default = "default_server_mode")]
    pub mode: String,

    /// HTTP server bind address
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

// Default value functions
fn default_config_version() -> u32 {
    1
}
fn default_false() -> bool {
    false
}
fn default_max_chunk_bytes() -> usize {
    800
}
fn default_overlap_bytes() -> usize {
    120
}
fn default_embedding_model() -> String {
    "AllMiniLML6V2".to_string()
}
fn default_max_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_embed_timeout_ms() -> u64 {
    20_000
}
fn default_workers() -> usize {
    num_cpus::get().clamp(2, 8)
}
fn default_queue_capacity() -> usize {
    256
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_max_deliveries() -> u32 {
    3
}
fn default_max_content_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_top_k() -> usize {
    5
}
fn default_overfetch_factor() -> usize {
    4
}
fn default_query_timeout_ms() -> u64 {
    20_000
}
fn default_server_mode() -> String {
    "stdio".to_string()
}
fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_config_version(),
            debug: false,
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            ingest: IngestConfig::default(),
            query: QueryConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: default_max_chunk_bytes(),
            overlap_bytes: default_overlap_bytes(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            max_batch_size: default_max_batch_size(),
            max_retries: default_max_retries(),
            timeout_ms: default_embed_timeout_ms(),
            model_cache_dir: None,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            embed_concurrency: default_embed_concurrency(),
            max_deliveries: default_max_deliveries(),
            max_content_bytes: default_max_content_bytes(),
            skip_languages: Vec::new(),
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_top_k(),
            overfetch_factor: default_overfetch_factor(),
            aggregation: ScoreAggregation::default(),
            timeout_ms: default_query_timeout_ms(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            mode: default_server_mode(),
            bind: default_bind_address(),
        }
    }
}

impl Settings {
    /// Loads settings from `snipdex.toml` in the current directory plus
    /// `SNIPDEX_` environment overrides.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(Path::new("snipdex.toml"))
    }

    /// Loads settings with an explicit config file path.
    pub fn load_from(path: &Path) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SNIPDEX_").split("__"))
            .extract()
    }

    /// Directory used to cache downloaded embedding models.
    #[must_use]
    pub fn model_cache_dir(&self) -> PathBuf {
        self.embedding.model_cache_dir.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from(".cache"))
                .join("snipdex/models")
        })
    }

    /// Writes the current settings as a commented starter config.
    pub fn save(&self, path: &Path) -> Result<(), crate::error::IngestError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::error::IngestError::InvalidEvent(format!("serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| crate::error::IngestError::InvalidEvent(format!("write config: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.version, 1);
        assert!(settings.chunking.max_chunk_bytes > settings.chunking.overlap_bytes);
        assert!(settings.ingest.queue_capacity > 0);
        assert!(settings.query.overfetch_factor >= 1);
    }

    #[test]
    fn toml_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snipdex.toml");
        let mut settings = Settings::default();
        settings.query.default_top_k = 9;
        settings.save(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.query.default_top_k, 9);
        assert_eq!(loaded.embedding.model, "AllMiniLML6V2");
    }
}
