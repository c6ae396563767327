use std::any::{Any, TypeId};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A typed domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **serializable** (the payload is stored as a JSON object)
/// - designed to be **append-only**
///
/// Implementing this marker trait is all a type needs to be appended to and
/// loaded from the event store; its wire name is decided by the
/// [`EventTypeResolver`](crate::EventTypeResolver) in use.
pub trait Event: Serialize + DeserializeOwned + Clone + core::fmt::Debug + Send + Sync + 'static {}

/// Object-safe view of an [`Event`], used wherever events of different types
/// travel together (a stream, a batch, a handler table).
pub trait DomainEvent: core::fmt::Debug + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;

    /// `TypeId` of the concrete event type.
    fn event_type_id(&self) -> TypeId;

    /// Fully-qualified Rust type name of the concrete event type.
    fn rust_type_name(&self) -> &'static str;

    /// Serialize the concrete event into a JSON value.
    fn to_json(&self) -> Result<JsonValue, serde_json::Error>;

    fn clone_boxed(&self) -> Box<dyn DomainEvent>;
}

impl<E: Event> DomainEvent for E {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn event_type_id(&self) -> TypeId {
        TypeId::of::<E>()
    }

    fn rust_type_name(&self) -> &'static str {
        std::any::type_name::<E>()
    }

    fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn clone_boxed(&self) -> Box<dyn DomainEvent> {
        Box::new(self.clone())
    }
}

impl dyn DomainEvent {
    /// Borrow the concrete event if it is of type `E`.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.as_any().downcast_ref::<E>()
    }

    pub fn is<E: Event>(&self) -> bool {
        self.event_type_id() == TypeId::of::<E>()
    }
}

impl Clone for Box<dyn DomainEvent> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}
