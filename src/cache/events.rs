//! Cache lifecycle events.
//!
//! Every state transition of the store is published as a [`CacheEvent`] so an
//! external store or UI layer can mirror cache state without polling.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::clock::{Clock, SystemClock};
use super::keys::{CacheKey, EntityTag, RequestId};
use super::transport::ErrorPayload;

/// Monotonic epoch for ordering events.
///
/// Events are published while the store lock is held, so epoch order equals
/// the order in which transitions were applied.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier for idempotency (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    // Queries
    QueryPending {
        cache_key: CacheKey,
        request_id: RequestId,
        force_refetch: bool,
    },
    QueryFulfilled {
        cache_key: CacheKey,
        request_id: RequestId,
    },
    QueryRejected {
        cache_key: CacheKey,
        request_id: RequestId,
        error: ErrorPayload,
    },
    QueryCancelled {
        cache_key: CacheKey,
        request_id: RequestId,
    },
    /// A start request was satisfied by an in-flight or cached result.
    QueryDeduplicated {
        cache_key: CacheKey,
        pending: bool,
    },

    // Mutations
    MutationPending {
        endpoint: String,
        request_id: RequestId,
    },
    MutationFulfilled {
        endpoint: String,
        request_id: RequestId,
        invalidated: BTreeSet<EntityTag>,
    },
    MutationRejected {
        endpoint: String,
        request_id: RequestId,
        error: ErrorPayload,
    },
    MutationCancelled {
        endpoint: String,
        request_id: RequestId,
    },

    // Invalidation and retention
    Invalidated {
        tags: BTreeSet<EntityTag>,
        refetched: Vec<CacheKey>,
        skipped_pending: Vec<CacheKey>,
    },
    Evicted {
        cache_key: CacheKey,
    },
}

impl EventKind {
    /// The query slot this event concerns, if any.
    pub fn cache_key(&self) -> Option<&CacheKey> {
        match self {
            EventKind::QueryPending { cache_key, .. }
            | EventKind::QueryFulfilled { cache_key, .. }
            | EventKind::QueryRejected { cache_key, .. }
            | EventKind::QueryCancelled { cache_key, .. }
            | EventKind::QueryDeduplicated { cache_key, .. }
            | EventKind::Evicted { cache_key } => Some(cache_key),
            _ => None,
        }
    }
}

/// Broadcast channel carrying lifecycle events to external subscribers.
///
/// Publishing never blocks; slow subscribers observe `Lagged` on their receiver.
/// Events are stamped with the same clock that stamps cache entries.
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
    epoch_counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    pub fn new(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            epoch_counter: AtomicU64::new(0),
            clock,
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event; a bus without subscribers drops it.
    pub fn publish(&self, kind: EventKind) -> Epoch {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch, self.clock.now());

        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Cache event published"
        );

        let _ = self.sender.send(event);
        epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, Arc::new(SystemClock))
    }
}
