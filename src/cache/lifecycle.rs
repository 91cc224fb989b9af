//! Request lifecycle controller.
//!
//! Governs one query or mutation execution from admission to settlement:
//! admission against the store, execution against the transport, response
//! transform, tag resolution and outcome recording.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::api::Api;
use super::clock::Clock;
use super::endpoint::EndpointDefinition;
use super::error::CacheError;
use super::keys::{CacheKey, EntityTag, RequestId};
use super::store::{
    Admission, Admit, CacheStore, MutationOutcome, QueryOutcome, Settlement, SettlementReceiver,
    Ticket,
};
use super::tags::resolve;
use super::transport::{ErrorPayload, Transport, TransportContext, TransportError};

const METRIC_TRANSPORT_MS: &str = "tagcache_transport_ms";

/// Wait until a settlement is delivered.
///
/// A sender dropped without delivering means the execution was abandoned.
async fn wait_settled(receiver: &SettlementReceiver) -> Settlement {
    let mut receiver = receiver.clone();
    match receiver.wait_for(Option::is_some).await {
        Ok(value) => value.clone().unwrap_or(Settlement::Cancelled),
        Err(_) => Settlement::Cancelled,
    }
}

/// A caller's view of one query request.
///
/// Every handle for the same in-flight execution observes the same settlement.
#[derive(Clone)]
pub struct QueryHandle {
    cache_key: CacheKey,
    admission: Admission,
    receiver: SettlementReceiver,
    store: Arc<CacheStore>,
}

impl QueryHandle {
    pub fn cache_key(&self) -> &CacheKey {
        &self.cache_key
    }

    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn request_id(&self) -> Option<RequestId> {
        self.admission.request_id()
    }

    /// The settlement, if already delivered.
    pub fn peek(&self) -> Option<Settlement> {
        self.receiver.borrow().clone()
    }

    pub async fn settled(&self) -> Settlement {
        wait_settled(&self.receiver).await
    }

    pub async fn result(&self) -> Result<Value, CacheError> {
        self.settled().await.into_result()
    }

    /// Cancel the execution this handle started.
    ///
    /// Handles that joined an existing execution or were satisfied from cache
    /// cannot cancel it; for them this returns false.
    pub fn abort(&self) -> bool {
        match self.admission {
            Admission::Started { request_id } => {
                self.store.cancel_query(&self.cache_key, request_id)
            }
            _ => false,
        }
    }
}

impl fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandle")
            .field("cache_key", &self.cache_key)
            .field("admission", &self.admission)
            .field("settled", &self.receiver.borrow().is_some())
            .finish()
    }
}

/// A caller's view of one mutation invocation.
#[derive(Clone)]
pub struct MutationHandle {
    endpoint: String,
    request_id: RequestId,
    receiver: SettlementReceiver,
    store: Arc<CacheStore>,
}

impl MutationHandle {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn peek(&self) -> Option<Settlement> {
        self.receiver.borrow().clone()
    }

    /// Resolves after the mutation's invalidation round has been started.
    pub async fn settled(&self) -> Settlement {
        wait_settled(&self.receiver).await
    }

    pub async fn result(&self) -> Result<Value, CacheError> {
        self.settled().await.into_result()
    }

    /// Cancel the mutation if it has not completed yet.
    pub fn abort(&self) -> bool {
        self.store.cancel_mutation(&self.endpoint, self.request_id)
    }
}

impl fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationHandle")
            .field("endpoint", &self.endpoint)
            .field("request_id", &self.request_id)
            .field("settled", &self.receiver.borrow().is_some())
            .finish()
    }
}

enum Execution {
    Completed(Result<Value, TransportError>),
    Cancelled,
}

enum Settles {
    Query(CacheKey),
    Mutation(String),
}

/// Rejects an execution as unexpected if its task ends before recording an
/// outcome, e.g. when the transport or a tag resolver panics.
struct SettleGuard {
    store: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
    settles: Settles,
    request_id: RequestId,
    armed: bool,
}

impl SettleGuard {
    fn new<T: Transport>(api: &Api<T>, settles: Settles, request_id: RequestId) -> Self {
        Self {
            store: Arc::clone(&api.inner.store),
            clock: Arc::clone(&api.inner.clock),
            settles,
            request_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SettleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let error = ErrorPayload::unexpected("execution ended without an outcome");
        let now = self.clock.now();
        match &self.settles {
            Settles::Query(cache_key) => {
                warn!(
                    cache_key = %cache_key,
                    request_id = %self.request_id,
                    "Query execution ended without an outcome"
                );
                self.store.settle_query(
                    cache_key,
                    self.request_id,
                    QueryOutcome::Rejected(error),
                    now,
                );
            }
            Settles::Mutation(endpoint) => {
                warn!(
                    endpoint = endpoint.as_str(),
                    request_id = %self.request_id,
                    "Mutation execution ended without an outcome"
                );
                let outcome = MutationOutcome::Rejected(error.clone());
                if let Some(sender) = self.store.complete_mutation(
                    endpoint,
                    self.request_id,
                    &outcome,
                    &BTreeSet::new(),
                    now,
                ) {
                    sender.send_replace(Some(Settlement::Rejected(error)));
                }
            }
        }
    }
}

impl<T: Transport> Api<T> {
    /// Request a query, subject to the admission rule.
    ///
    /// A pending slot is joined and a fulfilled slot is reused unless
    /// `force_refetch` is set; otherwise a new execution is spawned.
    #[instrument(skip(self, arg))]
    pub fn start_query(
        &self,
        endpoint: &str,
        arg: Value,
        force_refetch: bool,
    ) -> Result<QueryHandle, CacheError> {
        let definition = Arc::clone(self.inner.definition.query_endpoint(endpoint)?);
        let cache_key = CacheKey::new(endpoint, &arg);
        let admit = self.inner.store.admit_query(
            &cache_key,
            endpoint,
            &arg,
            force_refetch,
            self.inner.clock.now(),
        );
        let admission = admit.admission();

        let receiver = match admit {
            Admit::Start(Ticket {
                request_id,
                token,
                receiver,
            }) => {
                tokio::spawn(self.clone().run_query(
                    definition,
                    cache_key.clone(),
                    arg,
                    request_id,
                    token,
                ));
                receiver
            }
            Admit::Join { receiver, .. } | Admit::Satisfied { receiver } => receiver,
        };

        Ok(QueryHandle {
            cache_key,
            admission,
            receiver,
            store: Arc::clone(&self.inner.store),
        })
    }

    /// Execute a mutation. Every call is a distinct invocation.
    #[instrument(skip(self, arg))]
    pub fn start_mutation(&self, endpoint: &str, arg: Value) -> Result<MutationHandle, CacheError> {
        let definition = Arc::clone(self.inner.definition.mutation_endpoint(endpoint)?);
        let Ticket {
            request_id,
            token,
            receiver,
        } = self
            .inner
            .store
            .admit_mutation(endpoint, &arg, self.inner.clock.now());

        tokio::spawn(self.clone().run_mutation(definition, arg, request_id, token));

        Ok(MutationHandle {
            endpoint: endpoint.to_string(),
            request_id,
            receiver,
            store: Arc::clone(&self.inner.store),
        })
    }

    async fn perform(
        &self,
        definition: &EndpointDefinition<T::Args>,
        arg: &Value,
        token: &CancellationToken,
    ) -> Execution {
        let args = definition.build_args(arg);
        let ctx = TransportContext::new(definition.name(), token.clone());
        let started_at = Instant::now();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Execution::Cancelled,
            result = self.inner.transport.execute(args, ctx) => result,
        };

        histogram!(METRIC_TRANSPORT_MS, "kind" => definition.kind().as_str())
            .record(started_at.elapsed().as_secs_f64() * 1000.0);
        Execution::Completed(result)
    }

    /// Transform a raw response and resolve the endpoint's tags against it.
    fn resolve_success(
        &self,
        definition: &EndpointDefinition<T::Args>,
        raw: Value,
        arg: &Value,
    ) -> Result<(Value, BTreeSet<EntityTag>), ErrorPayload> {
        let data = definition.transform(raw);
        match resolve(
            definition.tags(),
            &data,
            arg,
            self.inner.definition.entity_types(),
        ) {
            Ok(tags) => Ok((data, tags)),
            Err(err) => {
                warn!(
                    endpoint = definition.name(),
                    error = %err,
                    "Entity tag validation failed"
                );
                Err(ErrorPayload::validation(err.to_string()))
            }
        }
    }

    async fn run_query(
        self,
        definition: Arc<EndpointDefinition<T::Args>>,
        cache_key: CacheKey,
        arg: Value,
        request_id: RequestId,
        token: CancellationToken,
    ) {
        let mut guard = SettleGuard::new(&self, Settles::Query(cache_key.clone()), request_id);
        let result = match self.perform(&definition, &arg, &token).await {
            Execution::Completed(result) => result,
            Execution::Cancelled => {
                guard.disarm();
                debug!(
                    cache_key = %cache_key,
                    request_id = %request_id,
                    "Query execution abandoned after cancel"
                );
                return;
            }
        };

        let outcome = match result {
            Ok(raw) => match self.resolve_success(&definition, raw, &arg) {
                Ok((data, tags)) => QueryOutcome::Fulfilled { data, tags },
                Err(error) => QueryOutcome::Rejected(error),
            },
            Err(err) => QueryOutcome::Rejected(err.into()),
        };

        guard.disarm();
        self.inner
            .store
            .settle_query(&cache_key, request_id, outcome, self.inner.clock.now());
    }

    async fn run_mutation(
        self,
        definition: Arc<EndpointDefinition<T::Args>>,
        arg: Value,
        request_id: RequestId,
        token: CancellationToken,
    ) {
        let mut guard = SettleGuard::new(
            &self,
            Settles::Mutation(definition.name().to_string()),
            request_id,
        );
        let result = match self.perform(&definition, &arg, &token).await {
            Execution::Completed(result) => result,
            Execution::Cancelled => {
                guard.disarm();
                debug!(
                    endpoint = definition.name(),
                    request_id = %request_id,
                    "Mutation execution abandoned after cancel"
                );
                return;
            }
        };

        let (outcome, invalidated) = match result {
            Ok(raw) => match self.resolve_success(&definition, raw, &arg) {
                Ok((data, tags)) => (MutationOutcome::Fulfilled(data), tags),
                Err(error) => (MutationOutcome::Rejected(error), BTreeSet::new()),
            },
            Err(err) => (MutationOutcome::Rejected(err.into()), BTreeSet::new()),
        };

        guard.disarm();
        let Some(sender) = self.inner.store.complete_mutation(
            definition.name(),
            request_id,
            &outcome,
            &invalidated,
            self.inner.clock.now(),
        ) else {
            return;
        };

        // Affected queries are pending before the mutation's callers wake up.
        if !invalidated.is_empty() {
            self.invalidate_tags(&invalidated);
        }

        let settlement = match outcome {
            MutationOutcome::Fulfilled(data) => Settlement::Fulfilled(data),
            MutationOutcome::Rejected(error) => Settlement::Rejected(error),
        };
        sender.send_replace(Some(settlement));
    }
}
