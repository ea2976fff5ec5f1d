//! Pipeline worker machinery.
//!
//! Events for different snippets run fully in parallel; events for the
//! same snippet serialize on a per-id async mutex so two re-ingestions can
//! never interleave their insert/delete phases. Embedding calls across all
//! workers share a bounded semaphore to respect provider limits.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chunking;
use crate::config::{ChunkingConfig, IngestConfig, Settings};
use crate::embedding::{BatchedEmbedder, EmbeddingProvider};
use crate::error::{EmbeddingError, IngestError, IngestResult};
use crate::ingest::{DeadLetter, Delivery, IngestHandle, IngestOutcome, NoOpReason, SnippetEvent};
use crate::store::{IndexEntry, VectorStore};
use crate::types::{ContentHash, ContentVersion, SnippetId};

/// Dead letters kept for diagnostics; older records are dropped first.
const DEAD_LETTER_CAP: usize = 128;

/// Counters and dead-letter depth, exposed on the health surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub indexed: u64,
    pub noops: u64,
    pub deleted: u64,
    pub failed: u64,
    pub dead_letters: usize,
    pub queue_free_slots: usize,
}

/// Running ingestion pipeline. Dropping it does not stop the workers;
/// cancel the token passed to [`IngestPipeline::spawn`] for that.
#[derive(Clone)]
pub struct IngestPipeline {
    inner: Arc<Inner>,
    handle: IngestHandle,
}

struct Inner {
    store: Arc<dyn VectorStore>,
    embedder: Arc<BatchedEmbedder>,
    chunking: ChunkingConfig,
    ingest: IngestConfig,
    embed_timeout: Duration,
    locks: DashMap<SnippetId, Arc<tokio::sync::Mutex<()>>>,
    embed_permits: Semaphore,
    latest_seq: Arc<DashMap<SnippetId, u64>>,
    redeliver_tx: mpsc::Sender<Delivery>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    indexed: AtomicU64,
    noops: AtomicU64,
    deleted: AtomicU64,
    failed: AtomicU64,
}

impl IngestPipeline {
    /// Starts the dispatcher and returns the pipeline plus the event
    /// handle given to trigger transports.
    pub fn spawn(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        settings: &Settings,
        shutdown: CancellationToken,
    ) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel::<Delivery>(settings.ingest.queue_capacity);
        let latest_seq = Arc::new(DashMap::new());

        let inner = Arc::new(Inner {
            store,
            embedder: Arc::new(BatchedEmbedder::new(
                provider,
                settings.embedding.max_batch_size,
                settings.embedding.max_retries,
            )),
            chunking: settings.chunking.clone(),
            ingest: settings.ingest.clone(),
            embed_timeout: Duration::from_millis(settings.embedding.timeout_ms),
            locks: DashMap::new(),
            embed_permits: Semaphore::new(settings.ingest.embed_concurrency.max(1)),
            latest_seq: Arc::clone(&latest_seq),
            redeliver_tx: tx.clone(),
            dead_letters: Mutex::new(Vec::new()),
            indexed: AtomicU64::new(0),
            noops: AtomicU64::new(0),
            deleted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });

        let handle = IngestHandle::new(tx, latest_seq);
        let pipeline = Self {
            inner: Arc::clone(&inner),
            handle: handle.clone(),
        };

        let workers = settings.ingest.workers.max(1);
        tokio::spawn(dispatch(inner, rx, workers, shutdown));

        (pipeline, handle)
    }

    #[must_use]
    pub fn handle(&self) -> IngestHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            indexed: self.inner.indexed.load(Ordering::Relaxed),
            noops: self.inner.noops.load(Ordering::Relaxed),
            deleted: self.inner.deleted.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            dead_letters: self.inner.dead_letters.lock().len(),
            queue_free_slots: self.handle.queue_free_slots(),
        }
    }

    /// Snapshot of dead-lettered events.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().clone()
    }
}

async fn dispatch(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<Delivery>,
    workers: usize,
    shutdown: CancellationToken,
) {
    let worker_permits = Arc::new(Semaphore::new(workers));
    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("ingestion pipeline shutting down");
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(delivery) => delivery,
                None => break,
            },
        };

        let Ok(permit) = Arc::clone(&worker_permits).acquire_owned().await else {
            break;
        };
        let inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let _permit = permit;
            inner.handle_delivery(delivery).await;
        });
    }
}

impl Inner {
    async fn handle_delivery(&self, delivery: Delivery) {
        let Delivery {
            event,
            deliveries,
            ack,
        } = delivery;
        let snippet_id = event.snippet_id().clone();
        let seq = event.seq();

        match self.process(&event).await {
            Ok(outcome) => {
                match &outcome {
                    IngestOutcome::Indexed { version, chunks, .. } => {
                        self.indexed.fetch_add(1, Ordering::Relaxed);
                        info!(snippet = %snippet_id, %version, chunks, "snippet indexed");
                    }
                    IngestOutcome::NoOp { reason, .. } => {
                        self.noops.fetch_add(1, Ordering::Relaxed);
                        debug!(snippet = %snippet_id, seq, ?reason, "event acknowledged as no-op");
                    }
                    IngestOutcome::Deleted {
                        entries_removed, ..
                    } => {
                        self.deleted.fetch_add(1, Ordering::Relaxed);
                        info!(snippet = %snippet_id, entries_removed, "snippet removed from index");
                    }
                    IngestOutcome::Failed { .. } => unreachable!("process returns Err on failure"),
                }
                if let Some(ack) = ack {
                    let _ = ack.send(outcome);
                }
            }
            Err(err) if err.is_retryable() && deliveries < self.ingest.max_deliveries => {
                warn!(
                    snippet = %snippet_id,
                    seq,
                    deliveries,
                    max = self.ingest.max_deliveries,
                    "ingestion failed, redelivering: {err}"
                );
                let redelivery = Delivery {
                    event,
                    deliveries: deliveries + 1,
                    ack,
                };
                if let Err(e) = self.redeliver_tx.try_send(redelivery) {
                    let dropped = match e {
                        mpsc::error::TrySendError::Full(d)
                        | mpsc::error::TrySendError::Closed(d) => d,
                    };
                    warn!(snippet = %snippet_id, seq, "redelivery queue unavailable");
                    // Dead-letter with the failure that caused the
                    // redelivery, not the state of the queue.
                    self.dead_letter(dropped, err);
                }
            }
            Err(err) => {
                self.dead_letter(
                    Delivery {
                        event,
                        deliveries,
                        ack,
                    },
                    err,
                );
            }
        }
    }

    fn dead_letter(&self, delivery: Delivery, error: IngestError) {
        let snippet_id = delivery.event.snippet_id().clone();
        let seq = delivery.event.seq();
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(
            snippet = %snippet_id,
            seq,
            deliveries = delivery.deliveries,
            code = error.status_code(),
            "ingestion dead-lettered: {error}"
        );
        let mut letters = self.dead_letters.lock();
        if letters.len() >= DEAD_LETTER_CAP {
            letters.remove(0);
        }
        letters.push(DeadLetter {
            snippet_id: snippet_id.clone(),
            seq,
            error: error.to_string(),
            status_code: error.status_code().to_string(),
            deliveries: delivery.deliveries,
            at: Utc::now(),
        });
        drop(letters);
        if let Some(ack) = delivery.ack {
            let _ = ack.send(IngestOutcome::Failed {
                snippet_id,
                error,
                deliveries: delivery.deliveries,
            });
        }
    }

    async fn process(&self, event: &SnippetEvent) -> IngestResult<IngestOutcome> {
        match event {
            SnippetEvent::Upsert {
                id,
                content,
                language,
                seq,
                ..
            } => self.process_upsert(id, content, language.as_deref(), *seq).await,
            SnippetEvent::Delete { id, seq, .. } => self.process_delete(id, *seq).await,
        }
    }

    async fn process_upsert(
        &self,
        id: &SnippetId,
        content: &str,
        language: Option<&str>,
        seq: u64,
    ) -> IngestResult<IngestOutcome> {
        debug!(snippet = %id, seq, state = "received", "processing upsert event");

        if let Some(lang) = language {
            if self
                .ingest
                .skip_languages
                .iter()
                .any(|s| s.eq_ignore_ascii_case(lang))
            {
                debug!(snippet = %id, language = lang, "skipping excluded language");
                return Ok(IngestOutcome::NoOp {
                    snippet_id: id.clone(),
                    reason: NoOpReason::UnsupportedLanguage,
                });
            }
        }

        if content.len() > self.ingest.max_content_bytes {
            warn!(
                snippet = %id,
                size = content.len(),
                limit = self.ingest.max_content_bytes,
                "skipping oversized snippet"
            );
            return Ok(IngestOutcome::NoOp {
                snippet_id: id.clone(),
                reason: NoOpReason::Oversized,
            });
        }

        let lock = self.snippet_lock(id);
        let _guard = lock.lock().await;

        // An accepted newer event for this snippet makes this one stale
        // even when the store holds no entries; without this a replayed
        // upsert from before a deletion would resurrect the snippet.
        if self.latest_seq.get(id).is_some_and(|newest| *newest > seq) {
            return Ok(IngestOutcome::NoOp {
                snippet_id: id.clone(),
                reason: NoOpReason::Stale,
            });
        }

        // Redelivery and replay detection against the live index entries.
        let current = self.store.current_version(id)?;
        if let Some((version, _)) = &current {
            if seq <= version.get() {
                return Ok(IngestOutcome::NoOp {
                    snippet_id: id.clone(),
                    reason: NoOpReason::Stale,
                });
            }
        }

        let normalized = chunking::normalize(content);
        if normalized.is_empty() {
            return Ok(IngestOutcome::NoOp {
                snippet_id: id.clone(),
                reason: NoOpReason::Empty,
            });
        }
        let content_hash = ContentHash::of(&normalized);
        if let Some((_, hash)) = &current {
            if hash == &content_hash {
                // Same content under a fresh sequence number: replayed
                // event, acknowledged without duplicating index entries.
                return Ok(IngestOutcome::NoOp {
                    snippet_id: id.clone(),
                    reason: NoOpReason::Unchanged,
                });
            }
        }

        let chunks = chunking::chunk(id, &normalized, language, &self.chunking);
        debug!(snippet = %id, seq, state = "chunked", chunks = chunks.len(), "content chunked");
        if chunks.is_empty() {
            return Ok(IngestOutcome::NoOp {
                snippet_id: id.clone(),
                reason: NoOpReason::Empty,
            });
        }

        let embeddings = {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|_| IngestError::Shutdown)?;
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let embedder = Arc::clone(&self.embedder);
            let embed_task = tokio::task::spawn_blocking(move || {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                embedder.embed_all(&refs)
            });
            match tokio::time::timeout(self.embed_timeout, embed_task).await {
                Err(_) => {
                    return Err(EmbeddingError::ProviderUnavailable(format!(
                        "embedding timed out after {:?}",
                        self.embed_timeout
                    ))
                    .into());
                }
                Ok(Err(join)) => {
                    return Err(EmbeddingError::ProviderUnavailable(format!(
                        "embedding task failed: {join}"
                    ))
                    .into());
                }
                Ok(Ok(result)) => result?,
            }
        };
        debug!(snippet = %id, seq, state = "embedded", "chunks embedded");

        // A newer event for this snippet may have been submitted while we
        // were embedding; abandon rather than overwrite its result.
        if self
            .latest_seq
            .get(id)
            .is_some_and(|newest| *newest > seq)
        {
            return Ok(IngestOutcome::NoOp {
                snippet_id: id.clone(),
                reason: NoOpReason::Superseded,
            });
        }

        let version = ContentVersion(seq);
        let now = Utc::now();
        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexEntry {
                snippet_id: id.clone(),
                chunk_index: chunk.index,
                version,
                content_hash: content_hash.clone(),
                model: embedding.model,
                vector: embedding.vector,
                span: chunk.span,
                text: chunk.text,
                language: language.map(str::to_string),
                indexed_at: now,
            })
            .collect();
        let chunk_count = entries.len();

        // Insert before delete: a reader must never find zero entries for
        // a snippet that previously had entries.
        self.store.upsert(entries)?;
        self.store.delete_older_than(id, version)?;
        debug!(snippet = %id, seq, state = "indexed", "index entries swapped");

        Ok(IngestOutcome::Indexed {
            snippet_id: id.clone(),
            version,
            chunks: chunk_count,
        })
    }

    async fn process_delete(
        &self,
        id: &SnippetId,
        seq: u64,
    ) -> IngestResult<IngestOutcome> {
        let lock = self.snippet_lock(id);
        let guard = lock.lock().await;

        // A deletion replayed from before the latest upsert must not tear
        // down the newer content.
        if let Some((version, _)) = self.store.current_version(id)? {
            if version.get() > seq {
                return Ok(IngestOutcome::NoOp {
                    snippet_id: id.clone(),
                    reason: NoOpReason::Stale,
                });
            }
        }

        let entries_removed = self.store.delete_snippet(id)?;
        drop(guard);
        // The registry entry goes once no other event for this id holds a
        // clone (map + ours = 2). `latest_seq` keeps the delete's sequence
        // so replayed older upserts stay stale.
        self.locks.remove_if(id, |_, l| Arc::strong_count(l) <= 2);
        Ok(IngestOutcome::Deleted {
            snippet_id: id.clone(),
            entries_removed,
        })
    }

    fn snippet_lock(&self, id: &SnippetId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
