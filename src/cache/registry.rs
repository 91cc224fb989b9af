//! Entity tag index.
//!
//! Tracks which cache keys currently provide which entity tags, enabling
//! invalidation lookups by tag. Buckets are kept per tag type, split into a
//! wildcard bucket (tags without id) and one bucket per id.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::keys::{CacheKey, EntityTag, TagId};

#[derive(Debug, Default)]
struct TypeBuckets {
    wildcard: HashSet<CacheKey>,
    by_id: HashMap<TagId, HashSet<CacheKey>>,
}

impl TypeBuckets {
    fn is_empty(&self) -> bool {
        self.wildcard.is_empty() && self.by_id.is_empty()
    }
}

/// Tracks tag → cache_keys and cache_key → tags mappings.
///
/// The reverse mapping lets a refetch replace a key's previous tags in one step.
#[derive(Debug, Default)]
pub struct TagRegistry {
    by_type: HashMap<String, TypeBuckets>,
    key_to_tags: HashMap<CacheKey, BTreeSet<EntityTag>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the tags a cache key provides.
    ///
    /// The key is removed from every bucket of its previous tags before being
    /// inserted into the buckets of `tags`.
    pub fn register(&mut self, cache_key: &CacheKey, tags: BTreeSet<EntityTag>) {
        self.unregister(cache_key);
        if tags.is_empty() {
            return;
        }

        for tag in &tags {
            let buckets = self.by_type.entry(tag.entity_type.clone()).or_default();
            match &tag.id {
                Some(id) => {
                    buckets
                        .by_id
                        .entry(id.clone())
                        .or_default()
                        .insert(cache_key.clone());
                }
                None => {
                    buckets.wildcard.insert(cache_key.clone());
                }
            }
        }
        self.key_to_tags.insert(cache_key.clone(), tags);
    }

    /// Remove a cache key and clean up its tag buckets.
    ///
    /// Returns true if the key was tracked.
    pub fn unregister(&mut self, cache_key: &CacheKey) -> bool {
        let Some(tags) = self.key_to_tags.remove(cache_key) else {
            return false;
        };

        for tag in tags {
            let Some(buckets) = self.by_type.get_mut(&tag.entity_type) else {
                continue;
            };
            match &tag.id {
                Some(id) => {
                    if let Some(keys) = buckets.by_id.get_mut(id) {
                        keys.remove(cache_key);
                        if keys.is_empty() {
                            buckets.by_id.remove(id);
                        }
                    }
                }
                None => {
                    buckets.wildcard.remove(cache_key);
                }
            }
            if buckets.is_empty() {
                self.by_type.remove(&tag.entity_type);
            }
        }
        true
    }

    /// All cache keys providing a tag matched by the invalidating `tag`.
    ///
    /// A specific id scans its own bucket plus the type's wildcard bucket; a
    /// wildcard scans every bucket of the type. The result is exactly the keys
    /// with a provided tag for which [`EntityTag::matches`] holds.
    pub fn keys_for_tag(&self, tag: &EntityTag) -> HashSet<CacheKey> {
        let Some(buckets) = self.by_type.get(&tag.entity_type) else {
            return HashSet::new();
        };

        let mut keys = buckets.wildcard.clone();
        match &tag.id {
            Some(id) => {
                if let Some(bucket) = buckets.by_id.get(id) {
                    keys.extend(bucket.iter().cloned());
                }
            }
            None => {
                for bucket in buckets.by_id.values() {
                    keys.extend(bucket.iter().cloned());
                }
            }
        }
        debug_assert!(keys.iter().all(|key| {
            self.key_to_tags
                .get(key)
                .is_some_and(|provided| provided.iter().any(|p| tag.matches(p)))
        }));
        keys
    }

    /// Deduplicated union of [`keys_for_tag`](Self::keys_for_tag) over `tags`.
    pub fn keys_for_tags<'a, I>(&self, tags: I) -> BTreeSet<CacheKey>
    where
        I: IntoIterator<Item = &'a EntityTag>,
    {
        tags.into_iter()
            .flat_map(|tag| self.keys_for_tag(tag))
            .collect()
    }

    pub fn tags_for_key(&self, cache_key: &CacheKey) -> BTreeSet<EntityTag> {
        self.key_to_tags
            .get(cache_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of cache keys providing at least one tag.
    pub fn key_count(&self) -> usize {
        self.key_to_tags.len()
    }
}
