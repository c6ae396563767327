use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chronicle_core::{EventId, ExpectedVersion, StreamName};
use chronicle_events::{Metadata, NormalizerError, Payload, RawEvent};

use super::stream::EventStream;

/// An event ready to be committed to a stream (no sequence number or version yet).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: a typed value implementing `Event`
/// 2. **DecoratedEvent**: optionally given an explicit id and metadata
/// 3. **WritableEvent**: normalized to `(event_type, payload)` by the `EventStore`
/// 4. **RawEvent**: persisted with its stream version and global sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct WritableEvent {
    pub id: EventId,
    pub event_type: String,
    pub payload: Payload,
    pub metadata: Metadata,
}

/// Event storage operation error.
///
/// These are **infrastructure errors** (storage, concurrency, decoding) as
/// opposed to domain errors (validation of value types).
///
/// ## Error Categories
///
/// - **Concurrency**: expected version did not match, or another writer took the version first
/// - **DuplicateEvent**: an event id was already persisted (idempotent retry)
/// - **MalformedEventRecord**: a stored row could not be turned into a `RawEvent`
/// - **Normalizer**: a domain event could not be (de)normalized
/// - **InvalidAppend**: the batch itself is unusable
/// - **Storage**: the backend failed (connection, SQL, poisoned lock)
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("duplicate event: {0}")]
    DuplicateEvent(String),

    #[error("malformed event record at sequence number {sequence_number}: {reason}")]
    MalformedEventRecord { sequence_number: u64, reason: String },

    #[error(transparent)]
    Normalizer(#[from] NormalizerError),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, EventStoreError::DuplicateEvent(_))
    }
}

/// Append-only storage of event streams with a global order.
///
/// ## Commit Semantics
///
/// `commit()`:
/// - rejects ids that already exist (`DuplicateEvent`), before looking at versions
/// - checks optimistic concurrency against the stream's highest version
/// - assigns versions `current + 1, current + 2, …`
/// - assigns the next global sequence numbers, gap-free across successful commits
/// - stamps one `recorded_at` for the whole batch
/// - persists the batch atomically (all or nothing)
///
/// An empty batch is a no-op and returns an empty vector.
///
/// ## Load Semantics
///
/// Both loads return an [`EventStream`] snapshot of the rows that matched
/// when the query ran:
/// - `load()` yields one stream's events with `version >= minimum_version`, in version order
/// - `load_all()` yields every event with `sequence_number >= minimum_sequence_number`,
///   in sequence order
#[async_trait]
pub trait EventStorage: Send + Sync {
    async fn commit(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<WritableEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError>;

    async fn load(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EventStream, EventStoreError>;

    async fn load_all(&self, minimum_sequence_number: u64) -> Result<EventStream, EventStoreError>;

    /// Create the backing schema if it does not exist yet.
    async fn setup(&self) -> Result<(), EventStoreError> {
        Ok(())
    }
}

#[async_trait]
impl<S> EventStorage for Arc<S>
where
    S: EventStorage + ?Sized,
{
    async fn commit(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<WritableEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        (**self).commit(stream, expected_version, events).await
    }

    async fn load(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EventStream, EventStoreError> {
        (**self).load(stream, minimum_version).await
    }

    async fn load_all(&self, minimum_sequence_number: u64) -> Result<EventStream, EventStoreError> {
        (**self).load_all(minimum_sequence_number).await
    }

    async fn setup(&self) -> Result<(), EventStoreError> {
        (**self).setup().await
    }
}
