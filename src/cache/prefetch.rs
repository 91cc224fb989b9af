//! Prefetch policy.
//!
//! Decides whether to start a query ahead of consumer demand, based on a
//! force flag or the age of the last fulfilled result.

use std::time::Duration;

use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, instrument};

use super::api::Api;
use super::error::CacheError;
use super::keys::CacheKey;
use super::lifecycle::QueryHandle;
use super::transport::Transport;

const METRIC_PREFETCH: &str = "tagcache_prefetch_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefetchOptions {
    /// Always refetch.
    Force,
    /// Refetch when the last fulfilled result is at least this old.
    /// A zero age carries no freshness bound and behaves like `Default`.
    MaxAge(Duration),
    /// Defer to the admission rule.
    #[default]
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchDecision {
    Skip,
    Fetch { force_refetch: bool },
}

impl PrefetchDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrefetchDecision::Skip => "skip",
            PrefetchDecision::Fetch {
                force_refetch: true,
            } => "force",
            PrefetchDecision::Fetch {
                force_refetch: false,
            } => "fetch",
        }
    }
}

/// Pure prefetch decision.
///
/// A `MaxAge` without any fulfilled result is a cold start and fetches. A
/// fulfilled timestamp later than `now` counts as fresh. `MaxAge(0)` is
/// treated as unset and defers to the admission rule.
pub fn decide(
    options: PrefetchOptions,
    last_fulfilled: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> PrefetchDecision {
    match options {
        PrefetchOptions::Force => PrefetchDecision::Fetch {
            force_refetch: true,
        },
        PrefetchOptions::MaxAge(max_age) if max_age.is_zero() => PrefetchDecision::Fetch {
            force_refetch: false,
        },
        PrefetchOptions::MaxAge(max_age) => match last_fulfilled {
            None => PrefetchDecision::Fetch {
                force_refetch: true,
            },
            Some(fulfilled_at) => {
                let elapsed = now - fulfilled_at;
                if elapsed.is_negative() || elapsed < max_age {
                    PrefetchDecision::Skip
                } else {
                    PrefetchDecision::Fetch {
                        force_refetch: true,
                    }
                }
            }
        },
        PrefetchOptions::Default => PrefetchDecision::Fetch {
            force_refetch: false,
        },
    }
}

impl<T: Transport> Api<T> {
    /// Start a query ahead of demand if the policy says so.
    ///
    /// Never waits for the transport; returns the handle of the dispatched
    /// request, or `None` when the cached result is fresh enough.
    #[instrument(skip(self, arg))]
    pub fn prefetch(
        &self,
        endpoint: &str,
        arg: Value,
        options: PrefetchOptions,
    ) -> Result<Option<QueryHandle>, CacheError> {
        self.inner.definition.query_endpoint(endpoint)?;

        let cache_key = CacheKey::new(endpoint, &arg);
        let last_fulfilled = self
            .inner
            .store
            .query_entry(&cache_key)
            .and_then(|entry| entry.fulfilled_at);
        let decision = decide(options, last_fulfilled, self.inner.clock.now());

        counter!(METRIC_PREFETCH, "decision" => decision.as_str()).increment(1);
        debug!(cache_key = %cache_key, decision = decision.as_str(), "Prefetch decided");

        match decision {
            PrefetchDecision::Skip => Ok(None),
            PrefetchDecision::Fetch { force_refetch } => self
                .start_query(endpoint, arg, force_refetch)
                .map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(secs)
    }

    const TEN_SECONDS: PrefetchOptions = PrefetchOptions::MaxAge(Duration::from_secs(10));

    #[test]
    fn force_always_refetches() {
        assert_eq!(
            decide(PrefetchOptions::Force, Some(at(0)), at(0)),
            PrefetchDecision::Fetch {
                force_refetch: true
            }
        );
    }

    #[test]
    fn max_age_skips_fresh_results() {
        assert_eq!(decide(TEN_SECONDS, Some(at(0)), at(5)), PrefetchDecision::Skip);
    }

    #[test]
    fn max_age_refetches_stale_results() {
        let expected = PrefetchDecision::Fetch {
            force_refetch: true,
        };
        assert_eq!(decide(TEN_SECONDS, Some(at(0)), at(15)), expected);
        assert_eq!(decide(TEN_SECONDS, Some(at(0)), at(10)), expected);
    }

    #[test]
    fn max_age_cold_start_fetches() {
        assert_eq!(
            decide(TEN_SECONDS, None, at(0)),
            PrefetchDecision::Fetch {
                force_refetch: true
            }
        );
    }

    #[test]
    fn max_age_ignores_clock_going_backwards() {
        assert_eq!(decide(TEN_SECONDS, Some(at(100)), at(50)), PrefetchDecision::Skip);
    }

    #[test]
    fn zero_max_age_defers_to_admission() {
        let options = PrefetchOptions::MaxAge(Duration::ZERO);
        let deferred = PrefetchDecision::Fetch {
            force_refetch: false,
        };
        assert_eq!(decide(options, Some(at(3)), at(3)), deferred);
        assert_eq!(decide(options, Some(at(3)), at(300)), deferred);
        assert_eq!(decide(options, None, at(0)), deferred);
    }

    #[test]
    fn default_defers_to_admission() {
        assert_eq!(
            decide(PrefetchOptions::default(), Some(at(0)), at(1000)),
            PrefetchDecision::Fetch {
                force_refetch: false
            }
        );
        assert_eq!(PrefetchDecision::Skip.as_str(), "skip");
    }
}
