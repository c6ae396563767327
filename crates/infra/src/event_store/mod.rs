//! Append-only event store.
//!
//! [`EventStorage`] is the persistence boundary (in-memory or PostgreSQL);
//! [`EventStore`] sits on top of it and speaks domain events: it normalizes
//! what is appended, denormalizes what is loaded and notifies an optional
//! [`EventPublisher`] after every successful commit.

pub mod in_memory;
pub mod postgres;
pub mod stream;
pub mod r#trait;

use std::sync::Arc;

use tracing::debug;

use chronicle_core::{ExpectedVersion, StreamName};
use chronicle_events::{
    CAUSATION_ID_KEY, CORRELATION_ID_KEY, DecoratedEvent, EventEnvelope, EventNormalizer, RawEvent,
};

pub use in_memory::InMemoryEventStorage;
pub use postgres::PostgresEventStorage;
pub use r#trait::{EventStorage, EventStoreError, WritableEvent};
pub use stream::{EventRecord, EventStream, RECORDED_AT_FORMAT};

/// Receives committed events, after the commit succeeded and never before.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event_store_id: &str, events: &[RawEvent]);
}

/// Domain-facing event store.
///
/// `append` normalizes events and commits them through the storage; loads
/// return an [`EnvelopeStream`] that denormalizes lazily. The store performs
/// no I/O of its own beyond delegation.
#[derive(Clone)]
pub struct EventStore {
    id: String,
    storage: Arc<dyn EventStorage>,
    normalizer: EventNormalizer,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl EventStore {
    pub fn new(
        id: impl Into<String>,
        storage: Arc<dyn EventStorage>,
        normalizer: EventNormalizer,
    ) -> Self {
        Self {
            id: id.into(),
            storage,
            normalizer,
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Identifier used to route catch-up work to this store.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage(&self) -> &Arc<dyn EventStorage> {
        &self.storage
    }

    pub fn normalizer(&self) -> &EventNormalizer {
        &self.normalizer
    }

    pub async fn setup(&self) -> Result<(), EventStoreError> {
        self.storage.setup().await
    }

    /// Append domain events to `stream`.
    ///
    /// Nothing is committed if any event fails to normalize. Concurrency and
    /// duplicate errors from the storage are returned unchanged.
    pub async fn append(
        &self,
        stream: &StreamName,
        expected_version: ExpectedVersion,
        events: Vec<DecoratedEvent>,
    ) -> Result<Vec<RawEvent>, EventStoreError> {
        let writable = events
            .into_iter()
            .map(|decorated| self.to_writable(decorated))
            .collect::<Result<Vec<_>, _>>()?;

        // 1) Commit (durable step)
        let committed = self.storage.commit(stream, expected_version, writable).await?;

        debug!(
            event_store_id = %self.id,
            stream = %stream,
            committed = committed.len(),
            "events appended"
        );

        // 2) Notify (only after the commit succeeded)
        if let Some(publisher) = &self.publisher {
            if !committed.is_empty() {
                publisher.publish(&self.id, &committed);
            }
        }

        Ok(committed)
    }

    pub async fn load(&self, stream: &StreamName) -> Result<EnvelopeStream, EventStoreError> {
        self.load_from(stream, 0).await
    }

    pub async fn load_from(
        &self,
        stream: &StreamName,
        minimum_version: u64,
    ) -> Result<EnvelopeStream, EventStoreError> {
        let inner = self.storage.load(stream, minimum_version).await?;
        Ok(self.envelopes(inner))
    }

    pub async fn load_all(
        &self,
        minimum_sequence_number: u64,
    ) -> Result<EnvelopeStream, EventStoreError> {
        let inner = self.storage.load_all(minimum_sequence_number).await?;
        Ok(self.envelopes(inner))
    }

    fn envelopes(&self, inner: EventStream) -> EnvelopeStream {
        EnvelopeStream {
            inner,
            normalizer: self.normalizer.clone(),
        }
    }

    fn to_writable(&self, decorated: DecoratedEvent) -> Result<WritableEvent, EventStoreError> {
        let (event, id, metadata) = decorated.into_parts();
        for key in [CORRELATION_ID_KEY, CAUSATION_ID_KEY] {
            if metadata.get(key).is_some_and(|value| !value.is_string()) {
                return Err(EventStoreError::InvalidAppend(format!(
                    "metadata key `{key}` must hold a string"
                )));
            }
        }
        let normalized = self.normalizer.normalize(event.as_ref())?;
        Ok(WritableEvent {
            id: id.unwrap_or_default(),
            event_type: normalized.event_type,
            payload: normalized.payload,
            metadata,
        })
    }
}

impl core::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventStore")
            .field("id", &self.id)
            .field("has_publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}

/// [`EventStream`] that yields denormalized [`EventEnvelope`]s.
#[derive(Debug, Clone)]
pub struct EnvelopeStream {
    inner: EventStream,
    normalizer: EventNormalizer,
}

impl EnvelopeStream {
    pub fn rewind(&mut self) {
        self.inner.rewind();
    }

    /// Drop the decoding layer and get the raw cursor back.
    pub fn into_raw(self) -> EventStream {
        self.inner
    }
}

impl Iterator for EnvelopeStream {
    type Item = Result<EventEnvelope, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw = match self.inner.next()? {
            Ok(raw) => raw,
            Err(e) => return Some(Err(e)),
        };

        Some(
            self.normalizer
                .denormalize(raw.payload(), raw.event_type())
                .map(|event| EventEnvelope::new(event, raw))
                .map_err(EventStoreError::from),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::EventId;
    use chronicle_events::{Event, EventTypeRegistry};
    use serde::{Deserialize, Serialize};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemCreated {
        sku: String,
    }

    impl Event for ItemCreated {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Unregistered {
        note: String,
    }

    impl Event for Unregistered {}

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<(String, Vec<u64>)>>,
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, event_store_id: &str, events: &[RawEvent]) {
            self.published.lock().unwrap().push((
                event_store_id.to_string(),
                events.iter().map(RawEvent::sequence_number).collect(),
            ));
        }
    }

    fn store() -> (EventStore, Arc<RecordingPublisher>) {
        let publisher = Arc::new(RecordingPublisher::default());
        let store = EventStore::new(
            "inventory",
            Arc::new(InMemoryEventStorage::new()),
            EventNormalizer::new(EventTypeRegistry::new().register_as::<ItemCreated>("inventory.item.created")),
        )
        .with_publisher(publisher.clone());
        (store, publisher)
    }

    fn item_stream() -> StreamName {
        StreamName::new("Inventory:Item-1").unwrap()
    }

    #[tokio::test]
    async fn append_then_load_returns_equal_domain_events() {
        let (store, _) = store();
        let id = EventId::new();

        let committed = store
            .append(
                &item_stream(),
                ExpectedVersion::NoStream,
                vec![
                    DecoratedEvent::new(ItemCreated { sku: "SKU-1".into() })
                        .with_id(id)
                        .with_correlation_id("order-7"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(committed[0].id(), id);
        assert_eq!(committed[0].event_type(), "inventory.item.created");
        assert_eq!(committed[0].correlation_id(), Some("order-7"));

        let loaded: Vec<EventEnvelope> = store
            .load(&item_stream())
            .await
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(
            loaded[0].downcast_ref::<ItemCreated>(),
            Some(&ItemCreated { sku: "SKU-1".into() })
        );
    }

    #[tokio::test]
    async fn publisher_sees_only_committed_events() {
        let (store, publisher) = store();

        store
            .append(&item_stream(), ExpectedVersion::NoStream, vec![ItemCreated { sku: "a".into() }.into()])
            .await
            .unwrap();
        let err = store
            .append(&item_stream(), ExpectedVersion::NoStream, vec![ItemCreated { sku: "b".into() }.into()])
            .await
            .unwrap_err();

        assert!(err.is_concurrency());
        assert_eq!(
            *publisher.published.lock().unwrap(),
            vec![("inventory".to_string(), vec![1])]
        );
    }

    #[tokio::test]
    async fn unregistered_types_reject_the_whole_batch() {
        let (store, publisher) = store();

        let err = store
            .append(
                &item_stream(),
                ExpectedVersion::Any,
                vec![
                    ItemCreated { sku: "a".into() }.into(),
                    Unregistered { note: "x".into() }.into(),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EventStoreError::Normalizer(chronicle_events::NormalizerError::UnsupportedType { .. })
        ));
        assert_eq!(store.load_all(1).await.unwrap().count(), 0);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn non_string_correlation_id_rejects_the_whole_batch() {
        let (store, publisher) = store();

        let err = store
            .append(
                &item_stream(),
                ExpectedVersion::Any,
                vec![
                    ItemCreated { sku: "a".into() }.into(),
                    DecoratedEvent::new(ItemCreated { sku: "b".into() })
                        .with_metadata(CORRELATION_ID_KEY, 42),
                ],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
        assert_eq!(store.load_all(1).await.unwrap().count(), 0);
        assert!(publisher.published.lock().unwrap().is_empty());
    }
}
