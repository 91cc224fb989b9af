//! Tag-invalidated query cache.
//!
//! Deduplicates in-flight requests, caches results per endpoint and argument,
//! and refetches cached queries when a mutation invalidates the entity tags
//! they provide.
//!
//! - **Store**: one slot per [`CacheKey`] plus an index from [`EntityTag`] to
//!   the keys providing it
//! - **Lifecycle**: admission, transport execution and outcome recording for
//!   queries and mutations
//! - **Invalidation**: push refetch of every query matched by a mutation's tags
//! - **Prefetch**: staleness-based decision to fetch ahead of demand
//!
//! ## Configuration
//!
//! Retention is controlled via the `[cache]` section of `tagcache.toml`:
//!
//! ```toml
//! [cache]
//! keep_unused_for_secs = 60
//! mutation_history_limit = 100
//! # ... see config.rs for all options
//! ```

mod api;
mod clock;
mod config;
mod endpoint;
mod error;
mod events;
mod invalidation;
mod keys;
mod lifecycle;
mod lock;
mod prefetch;
mod registry;
mod store;
mod tags;
mod transport;

pub use api::{Api, ApiBuilder};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use endpoint::{ApiDefinition, EndpointDefinition, EndpointKind};
pub use error::CacheError;
pub use events::{CacheEvent, Epoch, EventBus, EventKind};
pub use invalidation::{InvalidationPlan, RefetchTarget};
pub use keys::{CacheKey, EntityTag, RequestId, TagId};
pub use lifecycle::{MutationHandle, QueryHandle};
pub use prefetch::{PrefetchDecision, PrefetchOptions, decide};
pub use registry::TagRegistry;
pub use store::{
    Admission, CacheState, CacheStore, MutationEntry, MutationStatus, QueryEntry, QueryStatus,
    Settlement,
};
pub use tags::{TagDescription, TagFn, TagSpec, resolve};
pub use transport::{ErrorKind, ErrorPayload, Transport, TransportContext, TransportError};
