//! Cache key and entity tag definitions.
//!
//! Defines `CacheKey` for query result slots, `EntityTag` for the links between
//! mutations and the queries they invalidate, and `RequestId` for executions.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::CacheError;

/// Identifies one query result slot: an endpoint name plus its argument.
///
/// Rendered as `endpoint(<canonical json>)`. Object keys in the argument are
/// sorted before rendering, so structurally equal arguments always produce
/// the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(endpoint: &str, arg: &Value) -> Self {
        Self(format!("{endpoint}({})", canonical(arg)))
    }

    /// Build a key from any serializable argument.
    pub fn from_arg<A: Serialize + ?Sized>(endpoint: &str, arg: &A) -> Result<Self, CacheError> {
        let value = serde_json::to_value(arg)?;
        Ok(Self::new(endpoint, &value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The endpoint portion of the key.
    pub fn endpoint(&self) -> &str {
        self.0.split_once('(').map_or(self.0.as_str(), |(name, _)| name)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key.clone(), canonical(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// Identity of one entity inside a tag type.
///
/// Numbers and strings never compare equal: `5` and `"5"` are different ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagId {
    Num(i64),
    Str(String),
}

impl fmt::Display for TagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagId::Num(value) => write!(f, "{value}"),
            TagId::Str(value) => write!(f, "{value:?}"),
        }
    }
}

impl From<i64> for TagId {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

impl From<i32> for TagId {
    fn from(value: i32) -> Self {
        Self::Num(value.into())
    }
}

impl From<u32> for TagId {
    fn from(value: u32) -> Self {
        Self::Num(value.into())
    }
}

impl From<&str> for TagId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TagId {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// Abstract `{type, id?}` descriptor linking queries and mutations.
///
/// A tag without an id is a wildcard for its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTag {
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<TagId>,
}

impl EntityTag {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: None,
        }
    }

    pub fn with_id(entity_type: impl Into<String>, id: impl Into<TagId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: Some(id.into()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.id.is_none()
    }

    /// Whether this invalidating tag matches a provided tag.
    ///
    /// Types must be equal; ids match when either side is absent or both are equal.
    pub fn matches(&self, provided: &EntityTag) -> bool {
        if self.entity_type != provided.entity_type {
            return false;
        }
        match (&self.id, &provided.id) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        }
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}#{id}", self.entity_type),
            None => write!(f, "{}#*", self.entity_type),
        }
    }
}

/// Identity of a single query or mutation execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
