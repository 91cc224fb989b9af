//! Demo scenarios run by the `tagcache` binary against [`DemoServer`].

pub mod server;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{
    Admission, Api, CacheConfig, CacheError, CacheEvent, EventKind, ManualClock, PrefetchOptions,
    QueryStatus,
};
use crate::config::DemoSettings;

pub use server::{DemoServer, Post, ServerRequest, definition};

use server::{DECREMENT_COUNT, GET_COUNT, GET_POSTS, INCREMENT_COUNT, UPDATE_POST};

/// What the counter scenario observed.
#[derive(Debug, Clone, PartialEq)]
pub struct CounterReport {
    pub initial: Value,
    pub after_increments: Value,
    pub after_decrement: Value,
    /// Mutations after which `getCount` was already refetching.
    pub refetches_observed: u32,
    pub posts_refetched: bool,
}

/// Outcome of one prefetch call in the prefetch scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct PrefetchStep {
    pub label: &'static str,
    pub admission: Option<Admission>,
}

pub fn build_api(cache: CacheConfig, demo: &DemoSettings) -> Api<DemoServer> {
    Api::builder(definition(), DemoServer::new(demo.latency))
        .config(cache)
        .build()
}

/// Log every lifecycle event until the bus closes.
pub fn spawn_event_logger(api: &Api<DemoServer>) -> JoinHandle<()> {
    let mut events = api.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event logger lagged behind the cache");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &CacheEvent) {
    match &event.kind {
        EventKind::Invalidated {
            tags,
            refetched,
            skipped_pending,
        } => info!(
            epoch = event.epoch,
            tags = tags.len(),
            refetched = refetched.len(),
            skipped = skipped_pending.len(),
            "Tags invalidated"
        ),
        kind => debug!(
            epoch = event.epoch,
            cache_key = ?kind.cache_key(),
            event = ?kind,
            "Cache event"
        ),
    }
}

/// Fetch the counter, mutate it and let tag invalidation refresh the query.
pub async fn run_counter(
    cache: CacheConfig,
    demo: &DemoSettings,
) -> Result<CounterReport, CacheError> {
    let api = build_api(cache, demo);
    let logger = spawn_event_logger(&api);
    let gc = api.spawn_gc();

    let count_key = api.retain(GET_COUNT, &Value::Null)?;
    let initial = api.start_query(GET_COUNT, Value::Null, false)?.result().await?;
    info!(count = %initial, "Counter fetched");

    let mut refetches_observed = 0;
    let mut after_increments = initial.clone();
    for _ in 0..demo.increments.get() {
        let (refetched, count) = mutate_and_refresh(&api, INCREMENT_COUNT).await?;
        refetches_observed += u32::from(refetched);
        after_increments = count;
    }
    info!(count = %after_increments, refetches_observed, "Counter incremented");

    let (refetched, after_decrement) = mutate_and_refresh(&api, DECREMENT_COUNT).await?;
    refetches_observed += u32::from(refetched);
    info!(count = %after_decrement, "Counter decremented");

    api.start_query(GET_POSTS, Value::Null, false)?.result().await?;
    api.start_mutation(UPDATE_POST, json!({ "id": 1, "name": "Renamed post" }))?
        .result()
        .await?;
    let posts_refetched = api.status(GET_POSTS, &Value::Null) == QueryStatus::Pending;
    let posts = api.start_query(GET_POSTS, Value::Null, false)?.result().await?;
    info!(posts = %posts, posts_refetched, "Posts refreshed after update");

    api.release(&count_key);
    gc.abort();
    logger.abort();

    Ok(CounterReport {
        initial,
        after_increments,
        after_decrement,
        refetches_observed,
        posts_refetched,
    })
}

/// Run a counter mutation, then join the refetch it triggered.
///
/// The refetch has to settle before the next mutation; a still-pending query
/// is skipped by invalidation.
async fn mutate_and_refresh(
    api: &Api<DemoServer>,
    endpoint: &str,
) -> Result<(bool, Value), CacheError> {
    api.start_mutation(endpoint, json!(1))?.result().await?;
    let refetched = api.status(GET_COUNT, &Value::Null) == QueryStatus::Pending;
    let count = api.start_query(GET_COUNT, Value::Null, false)?.result().await?;
    Ok((refetched, count))
}

/// Walk the prefetch options against a manually advanced clock.
pub async fn run_prefetch(
    cache: CacheConfig,
    demo: &DemoSettings,
    max_age: Duration,
) -> Result<Vec<PrefetchStep>, CacheError> {
    let clock = Arc::new(ManualClock::default());
    let api = Api::builder(definition(), DemoServer::new(demo.latency))
        .config(cache)
        .clock(clock.clone())
        .build();
    let logger = spawn_event_logger(&api);

    let mut steps = Vec::new();
    steps.push(prefetch_step(&api, "cold start", PrefetchOptions::MaxAge(max_age)).await?);
    steps.push(prefetch_step(&api, "fresh result", PrefetchOptions::MaxAge(max_age)).await?);
    steps.push(prefetch_step(&api, "default", PrefetchOptions::Default).await?);
    clock.advance(max_age);
    steps.push(prefetch_step(&api, "stale result", PrefetchOptions::MaxAge(max_age)).await?);
    steps.push(prefetch_step(&api, "forced", PrefetchOptions::Force).await?);

    logger.abort();
    Ok(steps)
}

async fn prefetch_step(
    api: &Api<DemoServer>,
    label: &'static str,
    options: PrefetchOptions,
) -> Result<PrefetchStep, CacheError> {
    let admission = match api.prefetch(GET_COUNT, Value::Null, options)? {
        Some(handle) => {
            handle.result().await?;
            Some(handle.admission())
        }
        None => None,
    };
    info!(label, admission = ?admission, "Prefetch step");
    Ok(PrefetchStep { label, admission })
}
