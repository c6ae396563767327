use serde_json::Value as JsonValue;

use chronicle_core::EventId;

use crate::event::{DomainEvent, Event};
use crate::raw_event::{CAUSATION_ID_KEY, CORRELATION_ID_KEY, Metadata};

/// A domain event about to be appended, with optional id and metadata.
///
/// Supplying an explicit id makes retries of the same append idempotent: the
/// store rejects an id it has already persisted. When no id is given, a fresh
/// UUIDv7 is generated at normalization time.
#[derive(Debug, Clone)]
pub struct DecoratedEvent {
    event: Box<dyn DomainEvent>,
    id: Option<EventId>,
    metadata: Metadata,
}

impl DecoratedEvent {
    pub fn new<E: Event>(event: E) -> Self {
        Self::from_boxed(Box::new(event))
    }

    pub fn from_boxed(event: Box<dyn DomainEvent>) -> Self {
        Self {
            event,
            id: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<String>) -> Self {
        self.with_metadata(CORRELATION_ID_KEY, correlation_id.into())
    }

    pub fn with_causation_id(self, causation_id: impl Into<String>) -> Self {
        self.with_metadata(CAUSATION_ID_KEY, causation_id.into())
    }

    pub fn event(&self) -> &dyn DomainEvent {
        self.event.as_ref()
    }

    pub fn id(&self) -> Option<EventId> {
        self.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (Box<dyn DomainEvent>, Option<EventId>, Metadata) {
        (self.event, self.id, self.metadata)
    }
}

impl<E: Event> From<E> for DecoratedEvent {
    fn from(event: E) -> Self {
        Self::new(event)
    }
}
