use crate::event::{DomainEvent, Event};
use crate::raw_event::RawEvent;

/// A denormalized domain event together with the stored record it came from.
///
/// This is what readers of the event store and event listeners receive.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    event: Box<dyn DomainEvent>,
    raw: RawEvent,
}

impl EventEnvelope {
    pub fn new(event: Box<dyn DomainEvent>, raw: RawEvent) -> Self {
        Self { event, raw }
    }

    pub fn event(&self) -> &dyn DomainEvent {
        self.event.as_ref()
    }

    /// Borrow the domain event as `E`, if that is its concrete type.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }

    pub fn raw(&self) -> &RawEvent {
        &self.raw
    }

    pub fn sequence_number(&self) -> u64 {
        self.raw.sequence_number()
    }

    pub fn into_parts(self) -> (Box<dyn DomainEvent>, RawEvent) {
        (self.event, self.raw)
    }
}
