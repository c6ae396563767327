//! Optimistic concurrency expectations for stream appends.

/// What the caller believes the stream's current highest version to be.
///
/// Stream versions start at 1; an empty (non-existent) stream is at version 0.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking (useful for idempotent commands, migrations, etc.).
    Any,
    /// The stream must not contain any event yet.
    NoStream,
    /// Require the stream to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => actual == 0,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }
}

impl From<u64> for ExpectedVersion {
    fn from(value: u64) -> Self {
        ExpectedVersion::Exact(value)
    }
}
