use thiserror::Error;

use super::transport::ErrorPayload;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("endpoint `{0}` is not declared")]
    UnknownEndpoint(String),
    #[error("endpoint `{endpoint}` is a {actual}, expected a {expected}")]
    WrongEndpointKind {
        endpoint: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("entity type `{entity_type}` is not declared")]
    UnknownEntityType { entity_type: String },
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("request rejected: {0}")]
    Rejected(ErrorPayload),
    #[error("request was cancelled before it settled")]
    Cancelled,
}

impl CacheError {
    pub fn unknown_endpoint(name: impl Into<String>) -> Self {
        Self::UnknownEndpoint(name.into())
    }

    pub fn unknown_entity_type(entity_type: impl Into<String>) -> Self {
        Self::UnknownEntityType {
            entity_type: entity_type.into(),
        }
    }
}
