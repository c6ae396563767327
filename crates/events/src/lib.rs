//! `chronicle-events`: event contracts shared by the store and its listeners.
//!
//! This crate is storage-agnostic: it defines what an event is, how it is
//! named and (de)serialized, and what a listener looks like.

pub mod decorated;
pub mod envelope;
pub mod event;
pub mod listener;
pub mod normalizer;
pub mod raw_event;
pub mod resolver;

pub use decorated::DecoratedEvent;
pub use envelope::EventEnvelope;
pub use event::{DomainEvent, Event};
pub use listener::{EventHandlers, EventListener, HandlerResult, Projector};
pub use normalizer::{EventNormalizer, NormalizedEvent, NormalizerError};
pub use raw_event::{CAUSATION_ID_KEY, CORRELATION_ID_KEY, Metadata, Payload, RawEvent};
pub use resolver::{EventDecoder, EventTypeRegistry, EventTypeResolver, ResolvedEventType};
