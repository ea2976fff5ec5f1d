//! Ingestion pipeline: snippet-change events into index entries.
//!
//! Events arrive over a bounded channel decoupled from the transport that
//! produced them (HTTP call, agent tool, storage notification). Each event
//! walks the state machine `Received → Chunked → Embedded → Indexed →
//! Acknowledged`, with `Failed` reachable from any state. Ingesting the
//! same (snippet id, version) pair is idempotent no matter how many times
//! the triggering event is redelivered.

mod pipeline;

pub use pipeline::{IngestPipeline, PipelineStatus};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::{IngestError, IngestResult};
use crate::types::{ContentVersion, SnippetId};

/// Notification that a snippet's content was created, changed, or removed.
///
/// `seq` is the monotonic event sequence assigned by the trigger transport;
/// it doubles as the snippet's content version once indexed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SnippetEvent {
    Upsert {
        id: SnippetId,
        content: String,
        language: Option<String>,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
    Delete {
        id: SnippetId,
        seq: u64,
        timestamp: DateTime<Utc>,
    },
}

impl SnippetEvent {
    #[must_use]
    pub fn snippet_id(&self) -> &SnippetId {
        match self {
            Self::Upsert { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::Upsert { seq, .. } | Self::Delete { seq, .. } => *seq,
        }
    }
}

/// Why an event was acknowledged without touching the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    /// The event's sequence is not newer than the indexed version.
    Stale,
    /// Content hash matches the indexed version; replayed payload.
    Unchanged,
    /// Normalized content is empty; nothing to embed.
    Empty,
    /// Content exceeds the configured size cap.
    Oversized,
    /// The event's language tag is on the configured skip list.
    UnsupportedLanguage,
    /// A newer event for the same snippet arrived while this one was in
    /// flight; its work was abandoned rather than overwriting the newer
    /// result.
    Superseded,
}

/// Terminal outcome of one delivered event.
#[derive(Debug)]
pub enum IngestOutcome {
    Indexed {
        snippet_id: SnippetId,
        version: ContentVersion,
        chunks: usize,
    },
    NoOp {
        snippet_id: SnippetId,
        reason: NoOpReason,
    },
    Deleted {
        snippet_id: SnippetId,
        entries_removed: usize,
    },
    /// Redeliveries exhausted (or the failure was not retryable); the
    /// event is recorded in the dead-letter list. The prior good version
    /// of the snippet stays queryable.
    Failed {
        snippet_id: SnippetId,
        error: IngestError,
        deliveries: u32,
    },
}

/// Dead-lettered event record, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub snippet_id: SnippetId,
    pub seq: u64,
    pub error: String,
    pub status_code: String,
    pub deliveries: u32,
    pub at: DateTime<Utc>,
}

/// Sequence numbers for transports that do not carry their own.
///
/// Seeded from wall-clock milliseconds so sequences stay ahead of any
/// previously indexed version across restarts, then strictly increasing
/// within the process even if the clock steps backwards.
#[derive(Clone)]
pub struct SequenceSource {
    last: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

impl Default for SequenceSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceSource {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0)),
        }
    }

    pub fn next(&self) -> u64 {
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last
            .fetch_update(
                std::sync::atomic::Ordering::AcqRel,
                std::sync::atomic::Ordering::Acquire,
                |prev| Some(now.max(prev + 1)),
            )
            .map_or(now, |prev| now.max(prev + 1))
    }
}

pub(crate) struct Delivery {
    pub event: SnippetEvent,
    pub deliveries: u32,
    pub ack: Option<oneshot::Sender<IngestOutcome>>,
}

/// Sender half of the ingestion queue, handed to trigger transports.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Delivery>,
    latest_seq: std::sync::Arc<dashmap::DashMap<SnippetId, u64>>,
}

impl IngestHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<Delivery>,
        latest_seq: std::sync::Arc<dashmap::DashMap<SnippetId, u64>>,
    ) -> Self {
        Self { tx, latest_seq }
    }

    fn note_seq(&self, id: &SnippetId, seq: u64) {
        // Recorded only once the queue has accepted the event, so a
        // rejected submission can never mark accepted in-flight work as
        // superseded. In-flight older ingestions consult this map to
        // abandon their work.
        self.latest_seq
            .entry(id.clone())
            .and_modify(|s| *s = (*s).max(seq))
            .or_insert(seq);
    }

    /// Submits an event without waiting; rejects with `QueueFull` when the
    /// pipeline is saturated (backpressure, not unbounded fan-out).
    pub fn try_submit(&self, event: SnippetEvent) -> IngestResult<()> {
        let id = event.snippet_id().clone();
        let seq = event.seq();
        self.tx
            .try_send(Delivery {
                event,
                deliveries: 1,
                ack: None,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => IngestError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => IngestError::Shutdown,
            })?;
        self.note_seq(&id, seq);
        Ok(())
    }

    /// Submits an event and waits for its terminal outcome. Used by the
    /// synchronous API surfaces; storage-style triggers use `try_submit`.
    pub async fn submit_and_wait(&self, event: SnippetEvent) -> IngestResult<IngestOutcome> {
        let id = event.snippet_id().clone();
        let seq = event.seq();
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Delivery {
                event,
                deliveries: 1,
                ack: Some(ack_tx),
            })
            .await
            .map_err(|_| IngestError::Shutdown)?;
        self.note_seq(&id, seq);
        ack_rx.await.map_err(|_| IngestError::Shutdown)
    }

    /// Remaining free slots in the event queue.
    #[must_use]
    pub fn queue_free_slots(&self) -> usize {
        self.tx.capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_accessors() {
        let id = SnippetId::new("a.py").unwrap();
        let event = SnippetEvent::Delete {
            id: id.clone(),
            seq: 7,
            timestamp: Utc::now(),
        };
        assert_eq!(event.snippet_id(), &id);
        assert_eq!(event.seq(), 7);
    }

    #[test]
    fn sequence_source_is_strictly_increasing() {
        let source = SequenceSource::new();
        let a = source.next();
        let b = source.next();
        let c = source.next();
        assert!(a < b && b < c);
    }
}
