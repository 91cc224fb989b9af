//! Normalized cache state.
//!
//! `CacheState` holds one slot per cache key, the mutation history and the
//! entity tag index. It is a plain data structure changed only through
//! explicit commands (admit, settle, cancel, evict), so it can be exercised
//! without a runtime. `CacheStore` serializes access to it behind a single
//! mutex and publishes a lifecycle event for every applied transition.

use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lru::LruCache;
use metrics::{counter, gauge};
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::clock::Clock;
use super::config::CacheConfig;
use super::error::CacheError;
use super::events::{CacheEvent, EventBus, EventKind};
use super::keys::{CacheKey, EntityTag, RequestId};
use super::lock::mutex_lock;
use super::registry::TagRegistry;
use super::transport::ErrorPayload;

const SOURCE: &str = "cache::store";

const METRIC_QUERY_STARTED: &str = "tagcache_query_started_total";
const METRIC_QUERY_DEDUPED: &str = "tagcache_query_deduped_total";
const METRIC_QUERY_SETTLED: &str = "tagcache_query_settled_total";
const METRIC_MUTATION_SETTLED: &str = "tagcache_mutation_settled_total";
const METRIC_ENTRIES: &str = "tagcache_entries";

// ============================================================================
// Entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    Uninitialized,
    Pending,
    Fulfilled,
    Rejected,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Uninitialized => "uninitialized",
            QueryStatus::Pending => "pending",
            QueryStatus::Fulfilled => "fulfilled",
            QueryStatus::Rejected => "rejected",
        }
    }
}

/// Observable state of one query slot.
///
/// `data` and `fulfilled_at` survive a refetch: while a forced refetch is
/// pending, or after it was rejected, they still describe the last success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEntry {
    pub endpoint: String,
    pub arg: Value,
    pub status: QueryStatus,
    pub request_id: Option<RequestId>,
    pub data: Option<Value>,
    pub error: Option<ErrorPayload>,
    pub started_at: Option<OffsetDateTime>,
    pub fulfilled_at: Option<OffsetDateTime>,
    pub provided_tags: BTreeSet<EntityTag>,
}

impl QueryEntry {
    fn uninitialized(endpoint: &str, arg: &Value) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            arg: arg.clone(),
            status: QueryStatus::Uninitialized,
            request_id: None,
            data: None,
            error: None,
            started_at: None,
            fulfilled_at: None,
            provided_tags: BTreeSet::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    Pending,
    Fulfilled,
    Rejected,
}

/// State of one mutation invocation. Never shared between invocations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationEntry {
    pub endpoint: String,
    pub arg: Value,
    pub request_id: RequestId,
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<ErrorPayload>,
    pub started_at: OffsetDateTime,
    pub fulfilled_at: Option<OffsetDateTime>,
}

// ============================================================================
// Settlement and admission
// ============================================================================

/// Terminal outcome of one execution, shared by every caller observing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Fulfilled(Value),
    Rejected(ErrorPayload),
    Cancelled,
}

impl Settlement {
    pub fn outcome(&self) -> &'static str {
        match self {
            Settlement::Fulfilled(_) => "fulfilled",
            Settlement::Rejected(_) => "rejected",
            Settlement::Cancelled => "cancelled",
        }
    }

    pub fn into_result(self) -> Result<Value, CacheError> {
        match self {
            Settlement::Fulfilled(data) => Ok(data),
            Settlement::Rejected(error) => Err(CacheError::Rejected(error)),
            Settlement::Cancelled => Err(CacheError::Cancelled),
        }
    }
}

pub type SettlementReceiver = watch::Receiver<Option<Settlement>>;

/// Verdict of the admission rule for one `start_query` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new execution was issued.
    Started { request_id: RequestId },
    /// The caller joined the execution already in flight.
    AlreadyPending { request_id: RequestId },
    /// The cached fulfilled result satisfies the request.
    AlreadyFulfilled,
}

impl Admission {
    pub fn is_started(&self) -> bool {
        matches!(self, Admission::Started { .. })
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Admission::Started { request_id } | Admission::AlreadyPending { request_id } => {
                Some(*request_id)
            }
            Admission::AlreadyFulfilled => None,
        }
    }
}

/// A newly admitted execution that the caller must drive to settlement.
#[derive(Debug)]
pub(crate) struct Ticket {
    pub request_id: RequestId,
    pub token: CancellationToken,
    pub receiver: SettlementReceiver,
}

#[derive(Debug)]
pub(crate) enum Admit {
    Start(Ticket),
    Join {
        request_id: RequestId,
        receiver: SettlementReceiver,
    },
    Satisfied {
        receiver: SettlementReceiver,
    },
}

impl Admit {
    pub fn admission(&self) -> Admission {
        match self {
            Admit::Start(ticket) => Admission::Started {
                request_id: ticket.request_id,
            },
            Admit::Join { request_id, .. } => Admission::AlreadyPending {
                request_id: *request_id,
            },
            Admit::Satisfied { .. } => Admission::AlreadyFulfilled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum QueryOutcome {
    Fulfilled {
        data: Value,
        tags: BTreeSet<EntityTag>,
    },
    Rejected(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MutationOutcome {
    Fulfilled(Value),
    Rejected(ErrorPayload),
}

/// Receiver that already holds a settlement.
fn settled_receiver(settlement: Settlement) -> SettlementReceiver {
    let (_sender, receiver) = watch::channel(Some(settlement));
    receiver
}

#[derive(Debug)]
struct InFlight {
    request_id: RequestId,
    token: CancellationToken,
    sender: watch::Sender<Option<Settlement>>,
    /// Slot state before the pending transition; restored on cancel.
    previous: Option<QueryEntry>,
}

impl InFlight {
    fn open(previous: Option<QueryEntry>) -> (Self, Ticket) {
        let request_id = RequestId::new();
        let token = CancellationToken::new();
        let (sender, receiver) = watch::channel(None);
        let in_flight = Self {
            request_id,
            token: token.clone(),
            sender,
            previous,
        };
        let ticket = Ticket {
            request_id,
            token,
            receiver,
        };
        (in_flight, ticket)
    }

    fn tracks(&self, request_id: RequestId) -> bool {
        self.request_id == request_id
    }

    fn settle(self, settlement: Settlement) {
        self.sender.send_replace(Some(settlement));
    }
}

// ============================================================================
// CacheState
// ============================================================================

#[derive(Debug)]
struct QuerySlot {
    entry: QueryEntry,
    in_flight: Option<InFlight>,
    subscribers: usize,
    pinned: bool,
    released_at: Option<OffsetDateTime>,
}

impl QuerySlot {
    fn new(entry: QueryEntry) -> Self {
        Self {
            entry,
            in_flight: None,
            subscribers: 0,
            pinned: false,
            released_at: None,
        }
    }

    fn is_evictable(&self) -> bool {
        self.subscribers == 0 && !self.pinned && self.in_flight.is_none()
    }

    fn last_used(&self) -> Option<OffsetDateTime> {
        self.released_at
            .or(self.entry.fulfilled_at)
            .or(self.entry.started_at)
    }
}

/// Single owned cache state: query slots, mutation history and tag index.
#[derive(Debug)]
pub struct CacheState {
    queries: HashMap<CacheKey, QuerySlot>,
    mutations: LruCache<RequestId, MutationEntry>,
    pending_mutations: HashMap<RequestId, InFlight>,
    tags: TagRegistry,
}

impl CacheState {
    pub fn new(mutation_history_limit: NonZeroUsize) -> Self {
        Self {
            queries: HashMap::new(),
            mutations: LruCache::new(mutation_history_limit),
            pending_mutations: HashMap::new(),
            tags: TagRegistry::new(),
        }
    }

    /// Apply the admission rule for a query request.
    ///
    /// A pending slot is joined; a fulfilled slot satisfies the request unless
    /// `force_refetch` is set. Everything else transitions to pending.
    pub(crate) fn admit_query(
        &mut self,
        key: &CacheKey,
        endpoint: &str,
        arg: &Value,
        force_refetch: bool,
        now: OffsetDateTime,
    ) -> Admit {
        if let Some(slot) = self.queries.get(key) {
            if let Some(in_flight) = &slot.in_flight {
                return Admit::Join {
                    request_id: in_flight.request_id,
                    receiver: in_flight.sender.subscribe(),
                };
            }
            if slot.entry.status == QueryStatus::Fulfilled && !force_refetch {
                let data = slot.entry.data.clone().unwrap_or(Value::Null);
                return Admit::Satisfied {
                    receiver: settled_receiver(Settlement::Fulfilled(data)),
                };
            }
        }

        let previous = self.queries.get(key).map(|slot| slot.entry.clone());
        let slot = self
            .queries
            .entry(key.clone())
            .or_insert_with(|| QuerySlot::new(QueryEntry::uninitialized(endpoint, arg)));

        let (in_flight, ticket) = InFlight::open(previous);
        slot.entry.status = QueryStatus::Pending;
        slot.entry.request_id = Some(ticket.request_id);
        slot.entry.started_at = Some(now);
        slot.in_flight = Some(in_flight);
        Admit::Start(ticket)
    }

    /// Apply an outcome if it belongs to the execution the slot tracks.
    ///
    /// Returns the delivered settlement, or `None` for a stale outcome.
    pub(crate) fn settle_query(
        &mut self,
        key: &CacheKey,
        request_id: RequestId,
        outcome: QueryOutcome,
        now: OffsetDateTime,
    ) -> Option<Settlement> {
        let slot = self.queries.get_mut(key)?;
        if !slot.in_flight.as_ref()?.tracks(request_id) {
            return None;
        }
        let in_flight = slot.in_flight.take()?;

        let settlement = match outcome {
            QueryOutcome::Fulfilled { data, tags } => {
                slot.entry.status = QueryStatus::Fulfilled;
                slot.entry.data = Some(data.clone());
                slot.entry.error = None;
                slot.entry.fulfilled_at = Some(now);
                slot.entry.provided_tags = tags.clone();
                self.tags.register(key, tags);
                Settlement::Fulfilled(data)
            }
            QueryOutcome::Rejected(error) => {
                // Data and provided tags keep describing the last success.
                slot.entry.status = QueryStatus::Rejected;
                slot.entry.error = Some(error.clone());
                Settlement::Rejected(error)
            }
        };

        in_flight.settle(settlement.clone());
        Some(settlement)
    }

    /// Cancel the tracked execution and restore the slot's previous state.
    ///
    /// A slot created by the cancelled execution goes back to uninitialized,
    /// and is removed unless it gained a subscriber or a pin in the meantime.
    pub(crate) fn cancel_query(&mut self, key: &CacheKey, request_id: RequestId) -> bool {
        let Some(slot) = self.queries.get_mut(key) else {
            return false;
        };
        match &slot.in_flight {
            Some(in_flight) if in_flight.tracks(request_id) => {}
            _ => return false,
        }
        let Some(mut in_flight) = slot.in_flight.take() else {
            return false;
        };

        match in_flight.previous.take() {
            Some(previous) => slot.entry = previous,
            None if slot.subscribers > 0 || slot.pinned => {
                slot.entry = QueryEntry::uninitialized(&slot.entry.endpoint, &slot.entry.arg);
            }
            None => {
                self.queries.remove(key);
            }
        }

        in_flight.token.cancel();
        in_flight.settle(Settlement::Cancelled);
        true
    }

    pub(crate) fn admit_mutation(
        &mut self,
        endpoint: &str,
        arg: &Value,
        now: OffsetDateTime,
    ) -> Ticket {
        let (in_flight, ticket) = InFlight::open(None);
        self.mutations.put(
            ticket.request_id,
            MutationEntry {
                endpoint: endpoint.to_string(),
                arg: arg.clone(),
                request_id: ticket.request_id,
                status: MutationStatus::Pending,
                data: None,
                error: None,
                started_at: now,
                fulfilled_at: None,
            },
        );
        self.pending_mutations.insert(ticket.request_id, in_flight);
        ticket
    }

    /// Record a mutation outcome.
    ///
    /// The settlement is not delivered here: the returned sender lets the
    /// caller run invalidation first. `None` means the mutation was cancelled.
    pub(crate) fn complete_mutation(
        &mut self,
        request_id: RequestId,
        outcome: &MutationOutcome,
        now: OffsetDateTime,
    ) -> Option<watch::Sender<Option<Settlement>>> {
        let in_flight = self.pending_mutations.remove(&request_id)?;

        if let Some(entry) = self.mutations.peek_mut(&request_id) {
            match outcome {
                MutationOutcome::Fulfilled(data) => {
                    entry.status = MutationStatus::Fulfilled;
                    entry.data = Some(data.clone());
                    entry.fulfilled_at = Some(now);
                }
                MutationOutcome::Rejected(error) => {
                    entry.status = MutationStatus::Rejected;
                    entry.error = Some(error.clone());
                }
            }
        }

        Some(in_flight.sender)
    }

    pub(crate) fn cancel_mutation(&mut self, request_id: RequestId) -> bool {
        let Some(in_flight) = self.pending_mutations.remove(&request_id) else {
            return false;
        };
        self.mutations.pop(&request_id);
        in_flight.token.cancel();
        in_flight.settle(Settlement::Cancelled);
        true
    }

    pub fn query_entry(&self, key: &CacheKey) -> Option<&QueryEntry> {
        self.queries.get(key).map(|slot| &slot.entry)
    }

    pub fn mutation_entry(&self, request_id: RequestId) -> Option<&MutationEntry> {
        self.mutations.peek(&request_id)
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.tags
    }

    /// Number of query slots.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    // ========================================================================
    // Subscriptions and eviction
    // ========================================================================

    /// Register a subscriber, creating an uninitialized slot if needed.
    pub fn retain(&mut self, key: &CacheKey, endpoint: &str, arg: &Value) -> usize {
        let slot = self
            .queries
            .entry(key.clone())
            .or_insert_with(|| QuerySlot::new(QueryEntry::uninitialized(endpoint, arg)));
        slot.subscribers += 1;
        slot.released_at = None;
        slot.subscribers
    }

    /// Drop a subscriber. Returns the remaining count, `None` for unknown keys.
    pub fn release(&mut self, key: &CacheKey, now: OffsetDateTime) -> Option<usize> {
        let slot = self.queries.get_mut(key)?;
        slot.subscribers = slot.subscribers.saturating_sub(1);
        if slot.subscribers == 0 {
            slot.released_at = Some(now);
        }
        Some(slot.subscribers)
    }

    pub fn set_pinned(&mut self, key: &CacheKey, pinned: bool) -> bool {
        match self.queries.get_mut(key) {
            Some(slot) => {
                slot.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Whether the slot has no subscribers, is not pinned and is not pending.
    pub fn can_evict(&self, key: &CacheKey) -> bool {
        self.queries.get(key).is_some_and(QuerySlot::is_evictable)
    }

    /// Evict every evictable slot unused for at least `keep_unused_for`.
    pub fn collect_garbage(
        &mut self,
        now: OffsetDateTime,
        keep_unused_for: Duration,
    ) -> Vec<CacheKey> {
        let mut expired: Vec<CacheKey> = self
            .queries
            .iter()
            .filter(|(_, slot)| slot.is_evictable())
            .filter(|(_, slot)| match slot.last_used() {
                Some(last_used) => now - last_used >= keep_unused_for,
                None => true,
            })
            .map(|(key, _)| key.clone())
            .collect();
        expired.sort();

        for key in &expired {
            self.queries.remove(key);
            self.tags.unregister(key);
        }
        expired
    }
}

// ============================================================================
// CacheStore
// ============================================================================

/// Shared, synchronized owner of [`CacheState`].
///
/// The lock is never held across an await. Events are published while the
/// lock is held, so their epochs follow the order transitions were applied.
pub struct CacheStore {
    state: Mutex<CacheState>,
    events: EventBus,
}

impl CacheStore {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::new(config.mutation_history_limit_non_zero())),
            events: EventBus::new(config.event_buffer_non_zero(), clock),
        }
    }

    pub(crate) fn with<R>(
        &self,
        op: &'static str,
        f: impl FnOnce(&mut CacheState, &EventBus) -> R,
    ) -> R {
        let mut state = mutex_lock(&self.state, SOURCE, op);
        f(&mut state, &self.events)
    }

    pub(crate) fn admit_query(
        &self,
        key: &CacheKey,
        endpoint: &str,
        arg: &Value,
        force_refetch: bool,
        now: OffsetDateTime,
    ) -> Admit {
        self.with("admit_query", |state, events| {
            let admit = state.admit_query(key, endpoint, arg, force_refetch, now);
            match &admit {
                Admit::Start(ticket) => {
                    counter!(METRIC_QUERY_STARTED).increment(1);
                    debug!(
                        cache_key = %key,
                        request_id = %ticket.request_id,
                        force_refetch,
                        "Query pending"
                    );
                    events.publish(EventKind::QueryPending {
                        cache_key: key.clone(),
                        request_id: ticket.request_id,
                        force_refetch,
                    });
                }
                Admit::Join { .. } | Admit::Satisfied { .. } => {
                    let pending = matches!(admit, Admit::Join { .. });
                    counter!(METRIC_QUERY_DEDUPED).increment(1);
                    debug!(cache_key = %key, pending, "Query request already satisfied");
                    events.publish(EventKind::QueryDeduplicated {
                        cache_key: key.clone(),
                        pending,
                    });
                }
            }
            gauge!(METRIC_ENTRIES).set(state.len() as f64);
            admit
        })
    }

    pub(crate) fn settle_query(
        &self,
        key: &CacheKey,
        request_id: RequestId,
        outcome: QueryOutcome,
        now: OffsetDateTime,
    ) -> bool {
        self.with("settle_query", |state, events| {
            let Some(settlement) = state.settle_query(key, request_id, outcome, now) else {
                warn!(
                    cache_key = %key,
                    request_id = %request_id,
                    "Dropped stale query outcome"
                );
                return false;
            };

            counter!(METRIC_QUERY_SETTLED, "outcome" => settlement.outcome()).increment(1);
            debug!(
                cache_key = %key,
                request_id = %request_id,
                outcome = settlement.outcome(),
                "Query settled"
            );
            let kind = match settlement {
                Settlement::Rejected(error) => EventKind::QueryRejected {
                    cache_key: key.clone(),
                    request_id,
                    error,
                },
                _ => EventKind::QueryFulfilled {
                    cache_key: key.clone(),
                    request_id,
                },
            };
            events.publish(kind);
            true
        })
    }

    pub fn cancel_query(&self, key: &CacheKey, request_id: RequestId) -> bool {
        self.with("cancel_query", |state, events| {
            if !state.cancel_query(key, request_id) {
                return false;
            }
            counter!(METRIC_QUERY_SETTLED, "outcome" => "cancelled").increment(1);
            debug!(cache_key = %key, request_id = %request_id, "Query cancelled");
            events.publish(EventKind::QueryCancelled {
                cache_key: key.clone(),
                request_id,
            });
            gauge!(METRIC_ENTRIES).set(state.len() as f64);
            true
        })
    }

    pub(crate) fn admit_mutation(&self, endpoint: &str, arg: &Value, now: OffsetDateTime) -> Ticket {
        self.with("admit_mutation", |state, events| {
            let ticket = state.admit_mutation(endpoint, arg, now);
            debug!(endpoint, request_id = %ticket.request_id, "Mutation pending");
            events.publish(EventKind::MutationPending {
                endpoint: endpoint.to_string(),
                request_id: ticket.request_id,
            });
            ticket
        })
    }

    pub(crate) fn complete_mutation(
        &self,
        endpoint: &str,
        request_id: RequestId,
        outcome: &MutationOutcome,
        invalidated: &BTreeSet<EntityTag>,
        now: OffsetDateTime,
    ) -> Option<watch::Sender<Option<Settlement>>> {
        self.with("complete_mutation", |state, events| {
            let sender = state.complete_mutation(request_id, outcome, now)?;
            let (outcome_label, kind) = match outcome {
                MutationOutcome::Fulfilled(_) => (
                    "fulfilled",
                    EventKind::MutationFulfilled {
                        endpoint: endpoint.to_string(),
                        request_id,
                        invalidated: invalidated.clone(),
                    },
                ),
                MutationOutcome::Rejected(error) => (
                    "rejected",
                    EventKind::MutationRejected {
                        endpoint: endpoint.to_string(),
                        request_id,
                        error: error.clone(),
                    },
                ),
            };
            counter!(METRIC_MUTATION_SETTLED, "outcome" => outcome_label).increment(1);
            debug!(
                endpoint,
                request_id = %request_id,
                outcome = outcome_label,
                "Mutation settled"
            );
            events.publish(kind);
            Some(sender)
        })
    }

    pub fn cancel_mutation(&self, endpoint: &str, request_id: RequestId) -> bool {
        self.with("cancel_mutation", |state, events| {
            if !state.cancel_mutation(request_id) {
                return false;
            }
            counter!(METRIC_MUTATION_SETTLED, "outcome" => "cancelled").increment(1);
            events.publish(EventKind::MutationCancelled {
                endpoint: endpoint.to_string(),
                request_id,
            });
            true
        })
    }

    pub fn query_entry(&self, key: &CacheKey) -> Option<QueryEntry> {
        self.with("query_entry", |state, _| state.query_entry(key).cloned())
    }

    pub fn mutation_entry(&self, request_id: RequestId) -> Option<MutationEntry> {
        self.with("mutation_entry", |state, _| {
            state.mutation_entry(request_id).cloned()
        })
    }

    pub fn retain(&self, key: &CacheKey, endpoint: &str, arg: &Value) -> usize {
        self.with("retain", |state, _| {
            let count = state.retain(key, endpoint, arg);
            gauge!(METRIC_ENTRIES).set(state.len() as f64);
            count
        })
    }

    pub fn release(&self, key: &CacheKey, now: OffsetDateTime) -> Option<usize> {
        self.with("release", |state, _| state.release(key, now))
    }

    pub fn set_pinned(&self, key: &CacheKey, pinned: bool) -> bool {
        self.with("set_pinned", |state, _| state.set_pinned(key, pinned))
    }

    pub fn can_evict(&self, key: &CacheKey) -> bool {
        self.with("can_evict", |state, _| state.can_evict(key))
    }

    pub fn collect_garbage(&self, now: OffsetDateTime, keep_unused_for: Duration) -> Vec<CacheKey> {
        self.with("collect_garbage", |state, events| {
            let evicted = state.collect_garbage(now, keep_unused_for);
            for key in &evicted {
                events.publish(EventKind::Evicted {
                    cache_key: key.clone(),
                });
            }
            gauge!(METRIC_ENTRIES).set(state.len() as f64);
            evicted
        })
    }

    pub fn len(&self) -> usize {
        self.with("len", |state, _| state.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::transport::ErrorKind;

    fn state() -> CacheState {
        CacheState::new(NonZeroUsize::new(2).expect("non-zero"))
    }

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    fn count_key() -> CacheKey {
        CacheKey::new("getCount", &json!(null))
    }

    fn start(state: &mut CacheState, force: bool, now: OffsetDateTime) -> Admit {
        state.admit_query(&count_key(), "getCount", &json!(null), force, now)
    }

    fn fulfill(state: &mut CacheState, request_id: RequestId, data: Value, now: OffsetDateTime) {
        let outcome = QueryOutcome::Fulfilled {
            data,
            tags: BTreeSet::from([EntityTag::new("Counter")]),
        };
        assert!(
            state
                .settle_query(&count_key(), request_id, outcome, now)
                .is_some()
        );
    }

    fn ticket(admit: Admit) -> Ticket {
        match admit {
            Admit::Start(ticket) => ticket,
            other => panic!("expected a started execution, got {other:?}"),
        }
    }

    #[test]
    fn pending_slot_is_joined() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));

        let second = start(&mut state, true, at(1));
        assert_eq!(
            second.admission(),
            Admission::AlreadyPending {
                request_id: first.request_id
            }
        );
        let entry = state.query_entry(&count_key()).expect("slot");
        assert_eq!(entry.status, QueryStatus::Pending);
        assert_eq!(entry.started_at, Some(at(0)));
    }

    #[test]
    fn fulfilled_slot_satisfies_unless_forced() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        fulfill(&mut state, first.request_id, json!({"count": 0}), at(1));

        let again = start(&mut state, false, at(2));
        assert_eq!(again.admission(), Admission::AlreadyFulfilled);
        let Admit::Satisfied { receiver } = again else {
            panic!("expected cached result");
        };
        assert_eq!(
            *receiver.borrow(),
            Some(Settlement::Fulfilled(json!({"count": 0})))
        );

        let forced = start(&mut state, true, at(3));
        assert!(forced.admission().is_started());
    }

    #[test]
    fn refetch_keeps_previous_data_while_pending() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        fulfill(&mut state, first.request_id, json!({"count": 0}), at(1));

        let _refetch = ticket(start(&mut state, true, at(5)));
        let entry = state.query_entry(&count_key()).expect("slot");
        assert!(entry.is_pending());
        assert_eq!(entry.data, Some(json!({"count": 0})));
        assert_eq!(entry.fulfilled_at, Some(at(1)));
        assert_eq!(entry.started_at, Some(at(5)));
    }

    #[test]
    fn stale_outcome_is_dropped() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        assert!(state.cancel_query(&count_key(), first.request_id));
        let second = ticket(start(&mut state, false, at(1)));

        let late = QueryOutcome::Fulfilled {
            data: json!({"count": 99}),
            tags: BTreeSet::new(),
        };
        assert!(
            state
                .settle_query(&count_key(), first.request_id, late, at(2))
                .is_none()
        );
        let entry = state.query_entry(&count_key()).expect("slot");
        assert_eq!(entry.request_id, Some(second.request_id));
        assert!(entry.is_pending());
    }

    #[test]
    fn rejected_refetch_keeps_data_and_tags() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        fulfill(&mut state, first.request_id, json!({"count": 0}), at(1));

        let refetch = ticket(start(&mut state, true, at(2)));
        let error = ErrorPayload::new(ErrorKind::Rejected, json!({"status": 500}));
        let settlement = state
            .settle_query(
                &count_key(),
                refetch.request_id,
                QueryOutcome::Rejected(error.clone()),
                at(3),
            )
            .expect("tracked execution");
        assert_eq!(settlement, Settlement::Rejected(error.clone()));

        let entry = state.query_entry(&count_key()).expect("slot");
        assert_eq!(entry.status, QueryStatus::Rejected);
        assert_eq!(entry.error, Some(error));
        assert_eq!(entry.data, Some(json!({"count": 0})));
        assert_eq!(
            state.registry().tags_for_key(&count_key()),
            BTreeSet::from([EntityTag::new("Counter")])
        );
    }

    #[test]
    fn cancel_restores_previous_entry() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        fulfill(&mut state, first.request_id, json!({"count": 0}), at(1));
        let before = state.query_entry(&count_key()).cloned();

        let refetch = ticket(start(&mut state, true, at(2)));
        assert!(state.cancel_query(&count_key(), refetch.request_id));
        assert!(refetch.token.is_cancelled());
        assert_eq!(*refetch.receiver.borrow(), Some(Settlement::Cancelled));
        assert_eq!(state.query_entry(&count_key()).cloned(), before);

        assert!(!state.cancel_query(&count_key(), refetch.request_id));
    }

    #[test]
    fn cancel_of_first_execution_removes_slot() {
        let mut state = state();
        let first = ticket(start(&mut state, false, at(0)));
        assert!(state.cancel_query(&count_key(), first.request_id));
        assert!(state.query_entry(&count_key()).is_none());
        assert!(state.is_empty());
    }

    #[test]
    fn cancel_of_first_execution_keeps_retained_slot() {
        let mut state = state();
        let key = count_key();
        let first = ticket(start(&mut state, false, at(0)));
        assert_eq!(state.retain(&key, "getCount", &json!(null)), 1);
        assert!(state.set_pinned(&key, true));

        assert!(state.cancel_query(&key, first.request_id));
        let entry = state.query_entry(&key).expect("slot kept");
        assert_eq!(entry.status, QueryStatus::Uninitialized);
        assert_eq!(entry.request_id, None);
        assert_eq!(entry.started_at, None);
        assert!(!state.can_evict(&key));

        assert!(state.set_pinned(&key, false));
        assert_eq!(state.release(&key, at(1)), Some(0));
        assert!(state.can_evict(&key));
    }

    #[test]
    fn mutation_history_is_bounded() {
        let mut state = state();
        let first = state.admit_mutation("incrementCount", &json!(1), at(0));
        let second = state.admit_mutation("incrementCount", &json!(1), at(1));
        let third = state.admit_mutation("incrementCount", &json!(1), at(2));
        assert_ne!(first.request_id, second.request_id);

        assert!(state.mutation_entry(first.request_id).is_none());
        assert!(state.mutation_entry(third.request_id).is_some());

        // An evicted entry does not prevent its execution from settling.
        let sender = state
            .complete_mutation(
                first.request_id,
                &MutationOutcome::Fulfilled(json!({"count": 1})),
                at(3),
            )
            .expect("still in flight");
        sender.send_replace(Some(Settlement::Fulfilled(json!({"count": 1}))));
        assert!(first.receiver.borrow().is_some());
    }

    #[test]
    fn completed_mutation_records_outcome() {
        let mut state = state();
        let ticket = state.admit_mutation("incrementCount", &json!(1), at(0));
        state
            .complete_mutation(
                ticket.request_id,
                &MutationOutcome::Fulfilled(json!({"count": 1})),
                at(1),
            )
            .expect("in flight");

        let entry = state.mutation_entry(ticket.request_id).expect("entry");
        assert_eq!(entry.status, MutationStatus::Fulfilled);
        assert_eq!(entry.data, Some(json!({"count": 1})));
        assert_eq!(entry.fulfilled_at, Some(at(1)));
    }

    #[test]
    fn cancelled_mutation_is_forgotten() {
        let mut state = state();
        let ticket = state.admit_mutation("incrementCount", &json!(1), at(0));
        assert!(state.cancel_mutation(ticket.request_id));
        assert!(state.mutation_entry(ticket.request_id).is_none());
        assert!(
            state
                .complete_mutation(
                    ticket.request_id,
                    &MutationOutcome::Fulfilled(json!(null)),
                    at(1)
                )
                .is_none()
        );
    }

    #[test]
    fn eviction_requires_no_subscribers_pin_or_pending() {
        let mut state = state();
        let key = count_key();
        assert_eq!(state.retain(&key, "getCount", &json!(null)), 1);
        assert!(!state.can_evict(&key));

        assert_eq!(state.release(&key, at(0)), Some(0));
        assert!(state.can_evict(&key));

        assert!(state.set_pinned(&key, true));
        assert!(!state.can_evict(&key));
        assert!(state.set_pinned(&key, false));

        let pending = ticket(start(&mut state, false, at(1)));
        assert!(!state.can_evict(&key));
        fulfill(&mut state, pending.request_id, json!({"count": 0}), at(2));
        assert!(state.can_evict(&key));
    }

    #[test]
    fn garbage_collection_honours_keep_unused_for() {
        let mut state = state();
        let key = count_key();
        state.retain(&key, "getCount", &json!(null));
        let first = ticket(start(&mut state, false, at(0)));
        fulfill(&mut state, first.request_id, json!({"count": 0}), at(1));
        state.release(&key, at(10));

        let keep = Duration::from_secs(60);
        assert!(state.collect_garbage(at(30), keep).is_empty());

        let evicted = state.collect_garbage(at(70), keep);
        assert_eq!(evicted, vec![key.clone()]);
        assert!(state.query_entry(&key).is_none());
        assert_eq!(state.registry().key_count(), 0);
    }

    #[test]
    fn store_publishes_transitions_in_order() {
        let clock = Arc::new(ManualClock::new(at(40)));
        let store = CacheStore::new(&CacheConfig::default(), clock.clone());
        let mut events = store.subscribe();
        let key = count_key();

        let Admit::Start(ticket) = store.admit_query(&key, "getCount", &json!(null), false, at(0))
        else {
            panic!("expected a started execution");
        };
        let outcome = QueryOutcome::Fulfilled {
            data: json!({"count": 0}),
            tags: BTreeSet::new(),
        };
        assert!(store.settle_query(&key, ticket.request_id, outcome.clone(), at(1)));
        assert!(!store.settle_query(&key, ticket.request_id, outcome, at(2)));

        let pending = events.try_recv().expect("pending event");
        let fulfilled = events.try_recv().expect("fulfilled event");
        assert!(matches!(pending.kind, EventKind::QueryPending { .. }));
        assert!(matches!(fulfilled.kind, EventKind::QueryFulfilled { .. }));
        assert_eq!(pending.timestamp, at(40));
        assert_eq!(fulfilled.timestamp, clock.now());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = Arc::new(CacheStore::new(
            &CacheConfig::default(),
            Arc::new(ManualClock::default()),
        ));
        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            poisoner.with::<()>("poison", |_, _| panic!("poison the lock"));
        })
        .join();

        assert!(store.is_empty());
        store.retain(&count_key(), "getCount", &json!(null));
        assert_eq!(store.len(), 1);
    }
}
