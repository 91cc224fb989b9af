//! Invalidation planning and execution.
//!
//! Maps invalidated entity tags to the cached queries providing a matching
//! tag and forces a refetch of each one.

use std::collections::BTreeSet;
use std::fmt;

use metrics::counter;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::api::Api;
use super::events::EventKind;
use super::keys::{CacheKey, EntityTag};
use super::lifecycle::QueryHandle;
use super::store::CacheState;
use super::transport::Transport;

const METRIC_INVALIDATION_REFETCH: &str = "tagcache_invalidation_refetch_total";

/// A query slot selected for refetch.
#[derive(Debug, Clone, PartialEq)]
pub struct RefetchTarget {
    pub cache_key: CacheKey,
    pub endpoint: String,
    pub arg: Value,
}

/// Deduplicated refetch work for one set of invalidated tags.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct InvalidationPlan {
    /// Slots to refetch with `force_refetch`, in cache key order.
    pub refetch: Vec<RefetchTarget>,
    /// Matching slots skipped because an execution is already in flight.
    pub skipped_pending: Vec<CacheKey>,
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvalidationPlan {{ refetch: {}, skipped_pending: {} }}",
            self.refetch.len(),
            self.skipped_pending.len(),
        )
    }
}

impl InvalidationPlan {
    /// Look up every slot providing a tag matched by one of `tags`.
    ///
    /// Keys reached through several tags appear once.
    pub fn build(state: &CacheState, tags: &BTreeSet<EntityTag>) -> Self {
        let mut plan = Self::default();

        for cache_key in state.registry().keys_for_tags(tags) {
            let Some(entry) = state.query_entry(&cache_key) else {
                continue;
            };
            if entry.is_pending() {
                plan.skipped_pending.push(cache_key);
                continue;
            }
            plan.refetch.push(RefetchTarget {
                endpoint: entry.endpoint.clone(),
                arg: entry.arg.clone(),
                cache_key,
            });
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.refetch.is_empty() && self.skipped_pending.is_empty()
    }

    pub fn refetch_keys(&self) -> Vec<CacheKey> {
        self.refetch
            .iter()
            .map(|target| target.cache_key.clone())
            .collect()
    }
}

impl<T: Transport> Api<T> {
    /// Force a refetch of every cached query providing a tag matched by `tags`.
    ///
    /// Refetches happen whether or not anything currently subscribes to the
    /// affected queries. Returns the handles of the started refetches.
    #[instrument(skip_all, fields(tags = tags.len()))]
    pub fn invalidate_tags(&self, tags: &BTreeSet<EntityTag>) -> Vec<QueryHandle> {
        let plan = self.inner.store.with("plan_invalidation", |state, events| {
            let plan = InvalidationPlan::build(state, tags);
            events.publish(EventKind::Invalidated {
                tags: tags.clone(),
                refetched: plan.refetch_keys(),
                skipped_pending: plan.skipped_pending.clone(),
            });
            plan
        });

        if plan.is_empty() {
            return Vec::new();
        }

        info!(
            tags = ?tags.iter().map(ToString::to_string).collect::<Vec<_>>(),
            plan = %plan,
            "Invalidating cached queries"
        );
        counter!(METRIC_INVALIDATION_REFETCH).increment(plan.refetch.len() as u64);

        plan.refetch
            .into_iter()
            .filter_map(|target| {
                match self.start_query(&target.endpoint, target.arg, true) {
                    Ok(handle) => Some(handle),
                    Err(err) => {
                        warn!(
                            cache_key = %target.cache_key,
                            error = %err,
                            "Invalidation refetch failed to start"
                        );
                        None
                    }
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use serde_json::json;
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::store::{Admit, QueryOutcome};

    fn fulfilled(state: &mut CacheState, endpoint: &str, arg: Value, tags: &[EntityTag]) {
        let key = CacheKey::new(endpoint, &arg);
        let now = OffsetDateTime::UNIX_EPOCH;
        let Admit::Start(ticket) = state.admit_query(&key, endpoint, &arg, false, now) else {
            panic!("expected a started execution");
        };
        let outcome = QueryOutcome::Fulfilled {
            data: json!(null),
            tags: tags.iter().cloned().collect(),
        };
        state.settle_query(&key, ticket.request_id, outcome, now);
    }

    fn posts_state() -> CacheState {
        let mut state = CacheState::new(NonZeroUsize::MIN);
        fulfilled(&mut state, "getPosts", json!(null), &[EntityTag::new("Post")]);
        fulfilled(&mut state, "getPost", json!(5), &[EntityTag::with_id("Post", 5)]);
        fulfilled(&mut state, "getPost", json!(7), &[EntityTag::with_id("Post", 7)]);
        fulfilled(&mut state, "getUser", json!(1), &[EntityTag::with_id("User", 1)]);
        state
    }

    fn endpoints(plan: &InvalidationPlan) -> Vec<String> {
        plan.refetch
            .iter()
            .map(|target| target.cache_key.to_string())
            .collect()
    }

    #[test]
    fn wildcard_tag_plans_every_matching_query() {
        let plan = InvalidationPlan::build(&posts_state(), &BTreeSet::from([EntityTag::new("Post")]));
        assert_eq!(
            endpoints(&plan),
            vec!["getPost(5)", "getPost(7)", "getPosts(null)"]
        );
    }

    #[test]
    fn specific_tag_skips_other_ids() {
        let plan = InvalidationPlan::build(
            &posts_state(),
            &BTreeSet::from([EntityTag::with_id("Post", 5)]),
        );
        assert_eq!(endpoints(&plan), vec!["getPost(5)", "getPosts(null)"]);
        assert_eq!(plan.refetch[0].endpoint, "getPost");
        assert_eq!(plan.refetch[0].arg, json!(5));
    }

    #[test]
    fn overlapping_tags_are_deduplicated() {
        let plan = InvalidationPlan::build(
            &posts_state(),
            &BTreeSet::from([EntityTag::new("Post"), EntityTag::with_id("Post", 7)]),
        );
        assert_eq!(plan.refetch.len(), 3);
    }

    #[test]
    fn pending_queries_are_skipped() {
        let mut state = posts_state();
        let key = CacheKey::new("getPost", &json!(5));
        let admit = state.admit_query(&key, "getPost", &json!(5), true, OffsetDateTime::UNIX_EPOCH);
        assert!(admit.admission().is_started());

        let plan = InvalidationPlan::build(&state, &BTreeSet::from([EntityTag::with_id("Post", 5)]));
        assert_eq!(plan.skipped_pending, vec![key]);
        assert_eq!(endpoints(&plan), vec!["getPosts(null)"]);
    }

    #[test]
    fn unknown_tags_plan_nothing() {
        let plan = InvalidationPlan::build(&posts_state(), &BTreeSet::from([EntityTag::new("Comment")]));
        assert!(plan.is_empty());
    }
}
