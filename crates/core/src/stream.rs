//! Stream names: the logical partition an event belongs to.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Maximum length (in bytes) of a stream name; matches the storage column.
pub const MAX_STREAM_NAME_LENGTH: usize = 255;

/// Name of one event stream, formatted as `"<Context>:<Name>"`.
///
/// A stream usually holds the history of a single aggregate, e.g.
/// `"Inventory:Item-6f1c"`. Names starting with `$` are reserved for
/// virtual streams and are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();

        if value.len() > MAX_STREAM_NAME_LENGTH {
            return Err(DomainError::validation(format!(
                "stream name exceeds {MAX_STREAM_NAME_LENGTH} bytes"
            )));
        }
        if value.starts_with('$') {
            return Err(DomainError::validation(format!(
                "stream name '{value}' uses the reserved '$' prefix"
            )));
        }
        if value.chars().any(char::is_whitespace) {
            return Err(DomainError::validation(format!(
                "stream name '{value}' contains whitespace"
            )));
        }

        match value.split_once(':') {
            Some((context, name)) if !context.is_empty() && !name.is_empty() => Ok(Self(value)),
            _ => Err(DomainError::validation(format!(
                "stream name '{value}' must look like '<Context>:<Name>'"
            ))),
        }
    }

    /// Build a stream name from its context and name parts.
    pub fn from_parts(context: &str, name: &str) -> DomainResult<Self> {
        Self::new(format!("{context}:{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part before the first `:` (the bounded context).
    pub fn context(&self) -> &str {
        self.0.split_once(':').map(|(c, _)| c).unwrap_or_default()
    }

    /// The part after the first `:`.
    pub fn name(&self) -> &str {
        self.0.split_once(':').map(|(_, n)| n).unwrap_or_default()
    }
}

impl core::fmt::Display for StreamName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for StreamName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(value: StreamName) -> Self {
        value.0
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
