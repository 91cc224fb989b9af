//! Push invalidation driven by mutation tags.

mod support;

use std::collections::BTreeSet;

use serde_json::{Value, json};
use tagcache::cache::{
    Api, ApiDefinition, CacheEvent, EndpointDefinition, EntityTag, EventKind, QueryStatus,
    TagDescription, TagSpec,
};
use tokio::sync::broadcast;

use support::{Scripted, after};

fn post_tag(_: &Value, arg: &Value) -> Vec<TagDescription> {
    arg.get("id")
        .and_then(Value::as_i64)
        .or_else(|| arg.as_i64())
        .map(|id| vec![EntityTag::with_id("Post", id).into()])
        .unwrap_or_default()
}

fn api() -> Api<Scripted> {
    let definition = ApiDefinition::new(["Post", "Counter"])
        .endpoint(
            EndpointDefinition::query("listPosts", after(10)).provides(TagSpec::fixed(["Post"])),
        )
        .endpoint(
            EndpointDefinition::query("getPost", after(10)).provides(TagSpec::computed(post_tag)),
        )
        .endpoint(
            EndpointDefinition::mutation("touchPosts", after(10))
                .invalidates(TagSpec::fixed(["Post"])),
        )
        .endpoint(
            EndpointDefinition::mutation("updatePost", after(10))
                .invalidates(TagSpec::computed(post_tag)),
        )
        .endpoint(
            EndpointDefinition::query("getCount", after(10)).provides(TagSpec::fixed(["Counter"])),
        )
        .endpoint(
            EndpointDefinition::mutation("incrementCount", after(10))
                .invalidates(TagSpec::fixed(["Counter"])),
        );
    Api::new(definition, Scripted::default())
}

async fn fetch(api: &Api<Scripted>, endpoint: &str, arg: Value) {
    api.start_query(endpoint, arg, false)
        .expect("query")
        .result()
        .await
        .expect("fulfills");
}

fn drain(events: &mut broadcast::Receiver<CacheEvent>) -> Vec<EventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

async fn seed_posts(api: &Api<Scripted>) {
    fetch(api, "listPosts", Value::Null).await;
    fetch(api, "getPost", json!(5)).await;
    fetch(api, "getPost", json!(7)).await;
}

#[tokio::test(start_paused = true)]
async fn wildcard_invalidation_refetches_every_post_query() {
    let api = api();
    seed_posts(&api).await;

    api.start_mutation("touchPosts", Value::Null)
        .expect("mutation")
        .result()
        .await
        .expect("fulfills");

    assert_eq!(api.status("listPosts", &Value::Null), QueryStatus::Pending);
    assert_eq!(api.status("getPost", &json!(5)), QueryStatus::Pending);
    assert_eq!(api.status("getPost", &json!(7)), QueryStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn id_invalidation_spares_other_ids() {
    let api = api();
    seed_posts(&api).await;

    api.start_mutation("updatePost", json!({ "id": 5, "name": "renamed" }))
        .expect("mutation")
        .result()
        .await
        .expect("fulfills");

    assert_eq!(api.status("listPosts", &Value::Null), QueryStatus::Pending);
    assert_eq!(api.status("getPost", &json!(5)), QueryStatus::Pending);
    assert_eq!(api.status("getPost", &json!(7)), QueryStatus::Fulfilled);

    fetch(&api, "getPost", json!(5)).await;
    assert_eq!(api.transport().calls("getPost"), 3);
}

#[tokio::test(start_paused = true)]
async fn counter_refetches_without_a_second_call() {
    let api = api();
    let mut events = api.subscribe_events();

    let initial = api
        .start_query("getCount", Value::Null, false)
        .expect("query")
        .result()
        .await
        .expect("fulfills");
    assert_eq!(initial, json!({ "count": 0 }));
    let count_key = api.cache_key("getCount", &Value::Null).expect("key");
    drain(&mut events);

    api.start_mutation("incrementCount", json!(1))
        .expect("mutation")
        .result()
        .await
        .expect("fulfills");
    assert_eq!(api.status("getCount", &Value::Null), QueryStatus::Pending);

    // Wait for the refetch without issuing another query.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let entry = api.entry(&count_key).expect("entry");
    assert_eq!(entry.status, QueryStatus::Fulfilled);
    assert_eq!(entry.data, Some(json!({ "count": 1 })));
    assert_eq!(api.transport().calls("getCount"), 2);

    let kinds = drain(&mut events);
    let position = |predicate: &dyn Fn(&EventKind) -> bool| {
        kinds.iter().position(predicate).expect("event published")
    };
    let invalidated = position(&|kind| matches!(kind, EventKind::Invalidated { .. }));
    let refetch_pending = position(&|kind| {
        matches!(
            kind,
            EventKind::QueryPending { cache_key, force_refetch: true, .. } if *cache_key == count_key
        )
    });
    let mutation_fulfilled =
        position(&|kind| matches!(kind, EventKind::MutationFulfilled { .. }));
    let refetch_fulfilled = position(&|kind| {
        matches!(kind, EventKind::QueryFulfilled { cache_key, .. } if *cache_key == count_key)
    });

    assert!(mutation_fulfilled < invalidated);
    assert!(invalidated < refetch_pending);
    assert!(refetch_pending < refetch_fulfilled);

    let Some(EventKind::MutationFulfilled { invalidated, .. }) = kinds.get(mutation_fulfilled)
    else {
        panic!("mutation event missing");
    };
    assert_eq!(invalidated, &BTreeSet::from([EntityTag::new("Counter")]));
}

#[tokio::test(start_paused = true)]
async fn pending_queries_are_skipped() {
    let api = api();
    fetch(&api, "getCount", Value::Null).await;
    let mut events = api.subscribe_events();

    let refetch = api.start_query("getCount", Value::Null, true).expect("query");
    let handles = api.invalidate_tags(&BTreeSet::from([EntityTag::new("Counter")]));
    assert!(handles.is_empty());

    refetch.result().await.expect("fulfills");
    assert_eq!(api.transport().calls("getCount"), 2);

    let skipped = drain(&mut events).into_iter().find_map(|kind| match kind {
        EventKind::Invalidated {
            refetched,
            skipped_pending,
            ..
        } => Some((refetched, skipped_pending)),
        _ => None,
    });
    let (refetched, skipped_pending) = skipped.expect("invalidation event");
    assert!(refetched.is_empty());
    assert_eq!(skipped_pending, vec![refetch.cache_key().clone()]);
}

#[tokio::test(start_paused = true)]
async fn rejected_mutation_invalidates_nothing() {
    let api = api();
    fetch(&api, "getCount", Value::Null).await;

    api.transport().set_failing(true);
    let result = api
        .start_mutation("incrementCount", json!(1))
        .expect("mutation")
        .result()
        .await;
    assert!(result.is_err());

    assert_eq!(api.status("getCount", &Value::Null), QueryStatus::Fulfilled);
    assert_eq!(api.transport().calls("getCount"), 1);
}

#[tokio::test(start_paused = true)]
async fn evicted_queries_are_not_refetched() {
    let api = api();
    let key = api.retain("getPost", &json!(5)).expect("query endpoint");
    fetch(&api, "getPost", json!(5)).await;
    api.release(&key);
    api.store().collect_garbage(
        time::OffsetDateTime::now_utc() + time::Duration::hours(1),
        api.config().keep_unused_for(),
    );
    assert!(api.entry(&key).is_none());

    let handles = api.invalidate_tags(&BTreeSet::from([EntityTag::with_id("Post", 5)]));
    assert!(handles.is_empty());
    assert_eq!(api.transport().calls("getPost"), 1);
}
