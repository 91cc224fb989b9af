use std::error::Error as StdError;

use thiserror::Error;

use crate::{
    cache::{CacheError, ErrorKind},
    config::LoadError,
    infra::error::InfraError,
};

/// Flattened view of an error and its source chain, for reporting.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self { source, messages }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("validation failed: {0}")]
    Validation(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from_error("application::error::AppError", self)
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Validation(_) | AppError::Config(_) => 2,
            AppError::Cache(CacheError::Rejected(payload))
                if payload.kind == ErrorKind::Validation =>
            {
                2
            }
            AppError::Cache(CacheError::Cancelled) => 130,
            AppError::Cache(_) | AppError::Infra(_) => 1,
        }
    }
}
