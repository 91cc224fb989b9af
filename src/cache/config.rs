//! Cache configuration.
//!
//! Controls entry retention, mutation history and the event stream via the
//! `[cache]` section of `tagcache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

const DEFAULT_KEEP_UNUSED_FOR_SECS: u64 = 60;
const DEFAULT_MUTATION_HISTORY_LIMIT: usize = 100;
const DEFAULT_EVENT_BUFFER: usize = 256;
const DEFAULT_GC_INTERVAL_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// How long an unreferenced query entry survives before garbage collection.
    pub keep_unused_for_secs: u64,
    /// Maximum settled mutation entries kept for inspection.
    pub mutation_history_limit: usize,
    /// Capacity of the lifecycle event broadcast channel.
    pub event_buffer: usize,
    /// Interval (ms) of the background garbage collection task.
    pub gc_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            keep_unused_for_secs: DEFAULT_KEEP_UNUSED_FOR_SECS,
            mutation_history_limit: DEFAULT_MUTATION_HISTORY_LIMIT,
            event_buffer: DEFAULT_EVENT_BUFFER,
            gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
        }
    }
}

impl CacheConfig {
    pub fn keep_unused_for(&self) -> Duration {
        Duration::from_secs(self.keep_unused_for_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms.max(1))
    }

    /// Returns the mutation history limit as NonZeroUsize, clamping to 1 if zero.
    pub fn mutation_history_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.mutation_history_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Broadcast channels need a capacity of at least one.
    pub fn event_buffer_non_zero(&self) -> usize {
        self.event_buffer.max(1)
    }
}
