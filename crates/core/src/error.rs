//! Errors raised by the value types of this crate.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A value was rejected at construction.
///
/// Covers malformed stream names and unparsable identifiers. Concurrency and
/// storage failures are reported by the event store, not here.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Parse failure of a UUID-backed identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
