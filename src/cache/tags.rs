//! Entity tag resolution.
//!
//! Turns an endpoint's tag specification plus a result into the set of
//! entity tags it provides (queries) or invalidates (mutations).

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::CacheError;
use super::keys::EntityTag;

/// Shorthand for a tag: a bare type name or a full `{type, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagDescription {
    Type(String),
    Full(EntityTag),
}

impl TagDescription {
    pub fn expand(self) -> EntityTag {
        match self {
            TagDescription::Type(entity_type) => EntityTag::new(entity_type),
            TagDescription::Full(tag) => tag,
        }
    }
}

impl From<&str> for TagDescription {
    fn from(value: &str) -> Self {
        Self::Type(value.to_string())
    }
}

impl From<String> for TagDescription {
    fn from(value: String) -> Self {
        Self::Type(value)
    }
}

impl From<EntityTag> for TagDescription {
    fn from(value: EntityTag) -> Self {
        Self::Full(value)
    }
}

/// Computes tag shorthands from `(result, arg)`.
pub type TagFn = Arc<dyn Fn(&Value, &Value) -> Vec<TagDescription> + Send + Sync>;

/// How an endpoint describes its tags.
#[derive(Clone)]
pub enum TagSpec {
    Static(Vec<TagDescription>),
    Computed(TagFn),
}

impl TagSpec {
    pub fn fixed<I, D>(items: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<TagDescription>,
    {
        Self::Static(items.into_iter().map(Into::into).collect())
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Value, &Value) -> Vec<TagDescription> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }
}

impl fmt::Debug for TagSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagSpec::Static(items) => f.debug_tuple("Static").field(items).finish(),
            TagSpec::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Resolve a tag specification against a result and its argument.
///
/// Every produced type must be in `known_types`; the first unknown type fails
/// the whole resolution. A missing specification resolves to no tags.
pub fn resolve(
    spec: Option<&TagSpec>,
    result: &Value,
    arg: &Value,
    known_types: &BTreeSet<String>,
) -> Result<BTreeSet<EntityTag>, CacheError> {
    let descriptions = match spec {
        None => return Ok(BTreeSet::new()),
        Some(TagSpec::Static(items)) => items.clone(),
        Some(TagSpec::Computed(f)) => f(result, arg),
    };

    descriptions
        .into_iter()
        .map(TagDescription::expand)
        .map(|tag| {
            if known_types.contains(&tag.entity_type) {
                Ok(tag)
            } else {
                Err(CacheError::unknown_entity_type(tag.entity_type))
            }
        })
        .collect()
}
