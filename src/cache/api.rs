//! Cache API facade.
//!
//! [`Api`] ties an [`ApiDefinition`] to a [`Transport`] and the shared
//! [`CacheStore`]. It is a cheap, clonable handle; clones observe the same
//! cache. Query, mutation, invalidation and prefetch entry points live in
//! their own modules as further `impl Api` blocks.

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::config::CacheConfig;
use super::endpoint::ApiDefinition;
use super::error::CacheError;
use super::events::CacheEvent;
use super::keys::{CacheKey, RequestId};
use super::store::{CacheStore, MutationEntry, QueryEntry, QueryStatus};
use super::transport::Transport;

pub(super) struct ApiInner<T: Transport> {
    pub(super) definition: ApiDefinition<T::Args>,
    pub(super) transport: T,
    pub(super) store: Arc<CacheStore>,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) config: CacheConfig,
}

/// Client-side cache over a set of declared endpoints.
///
/// Entry points that start executions spawn Tokio tasks and must be called
/// from within a Tokio runtime.
pub struct Api<T: Transport> {
    pub(super) inner: Arc<ApiInner<T>>,
}

impl<T: Transport> Clone for Api<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub struct ApiBuilder<T: Transport> {
    definition: ApiDefinition<T::Args>,
    transport: T,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
}

impl<T: Transport> ApiBuilder<T> {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Api<T> {
        info!(
            endpoints = self.definition.len(),
            entity_types = ?self.definition.entity_types(),
            keep_unused_for_secs = self.config.keep_unused_for_secs,
            "Cache api initialized"
        );
        Api {
            inner: Arc::new(ApiInner {
                store: Arc::new(CacheStore::new(&self.config, Arc::clone(&self.clock))),
                definition: self.definition,
                transport: self.transport,
                clock: self.clock,
                config: self.config,
            }),
        }
    }
}

impl<T: Transport> Api<T> {
    pub fn builder(definition: ApiDefinition<T::Args>, transport: T) -> ApiBuilder<T> {
        ApiBuilder {
            definition,
            transport,
            config: CacheConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Api with default configuration and the system clock.
    pub fn new(definition: ApiDefinition<T::Args>, transport: T) -> Self {
        Self::builder(definition, transport).build()
    }

    pub fn definition(&self) -> &ApiDefinition<T::Args> {
        &self.inner.definition
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn cache_key<A: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        arg: &A,
    ) -> Result<CacheKey, CacheError> {
        CacheKey::from_arg(endpoint, arg)
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn query_entry(&self, endpoint: &str, arg: &Value) -> Option<QueryEntry> {
        self.inner.store.query_entry(&CacheKey::new(endpoint, arg))
    }

    pub fn entry(&self, key: &CacheKey) -> Option<QueryEntry> {
        self.inner.store.query_entry(key)
    }

    /// Status of a slot; a missing slot reads as uninitialized.
    pub fn status(&self, endpoint: &str, arg: &Value) -> QueryStatus {
        self.query_entry(endpoint, arg)
            .map_or(QueryStatus::Uninitialized, |entry| entry.status)
    }

    pub fn mutation_entry(&self, request_id: RequestId) -> Option<MutationEntry> {
        self.inner.store.mutation_entry(request_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.store.subscribe()
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    /// Start a query with a serializable argument and decode its result.
    pub async fn query_typed<A, R>(&self, endpoint: &str, arg: &A) -> Result<R, CacheError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arg = serde_json::to_value(arg)?;
        let data = self.start_query(endpoint, arg, false)?.result().await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Run a mutation with a serializable argument and decode its result.
    pub async fn mutate_typed<A, R>(&self, endpoint: &str, arg: &A) -> Result<R, CacheError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let arg = serde_json::to_value(arg)?;
        let data = self.start_mutation(endpoint, arg)?.result().await?;
        Ok(serde_json::from_value(data)?)
    }

    // ========================================================================
    // Subscriptions and garbage collection
    // ========================================================================

    /// Register a subscriber for a query slot and return its key.
    pub fn retain(&self, endpoint: &str, arg: &Value) -> Result<CacheKey, CacheError> {
        self.inner.definition.query_endpoint(endpoint)?;
        let key = CacheKey::new(endpoint, arg);
        let subscribers = self.inner.store.retain(&key, endpoint, arg);
        debug!(cache_key = %key, subscribers, "Query slot retained");
        Ok(key)
    }

    /// Drop a subscriber. Returns the remaining count, `None` for unknown keys.
    pub fn release(&self, key: &CacheKey) -> Option<usize> {
        self.inner.store.release(key, self.inner.clock.now())
    }

    pub fn pin(&self, key: &CacheKey) -> bool {
        self.inner.store.set_pinned(key, true)
    }

    pub fn unpin(&self, key: &CacheKey) -> bool {
        self.inner.store.set_pinned(key, false)
    }

    pub fn can_evict(&self, key: &CacheKey) -> bool {
        self.inner.store.can_evict(key)
    }

    /// Evict unreferenced slots unused for longer than `keep_unused_for`.
    pub fn collect_garbage(&self) -> Vec<CacheKey> {
        let evicted = self
            .inner
            .store
            .collect_garbage(self.inner.clock.now(), self.inner.config.keep_unused_for());
        if !evicted.is_empty() {
            info!(evicted = evicted.len(), "Cache garbage collected");
        }
        evicted
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `gc_interval`.
    pub fn spawn_gc(&self) -> JoinHandle<()> {
        let api = self.clone();
        let period = self.inner.config.gc_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                api.collect_garbage();
            }
        })
    }
}
