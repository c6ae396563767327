use std::any::{TypeId, type_name};
use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::event::{DomainEvent, Event};

/// Builds a concrete domain event from its JSON payload.
pub type EventDecoder = fn(JsonValue) -> Result<Box<dyn DomainEvent>, serde_json::Error>;

/// A wire name resolved back to a Rust event type.
#[derive(Clone, Copy)]
pub struct ResolvedEventType {
    pub type_id: TypeId,
    pub rust_type_name: &'static str,
    pub decode: EventDecoder,
}

impl core::fmt::Debug for ResolvedEventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResolvedEventType")
            .field("rust_type_name", &self.rust_type_name)
            .finish_non_exhaustive()
    }
}

/// Bidirectional mapping between Rust event types and stored event-type names.
///
/// Must be a bijection over the registered types: two Rust types never share
/// a wire name, and a wire name always resolves to the same type.
pub trait EventTypeResolver: Send + Sync {
    /// Wire name for the Rust type `type_id`, or `None` if the type is not supported.
    fn event_type_for(&self, type_id: TypeId, rust_type_name: &'static str) -> Option<String>;

    /// Rust type for a stored wire name, or `None` if it is unknown.
    fn resolve(&self, event_type: &str) -> Option<ResolvedEventType>;
}

/// Default resolver.
///
/// A type registered with [`register`](Self::register) is stored under its
/// fully-qualified Rust type name. [`register_as`](Self::register_as) picks a
/// stable wire name instead, and [`alias`](Self::alias) keeps historical names
/// decodable after a rename. Unregistered types have no stored name.
#[derive(Debug, Default, Clone)]
pub struct EventTypeRegistry {
    names: HashMap<TypeId, String>,
    types: HashMap<String, ResolvedEventType>,
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<E: Event>(self) -> Self {
        self.register_as::<E>(type_name::<E>())
    }

    pub fn register_as<E: Event>(mut self, event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        self.names.insert(TypeId::of::<E>(), event_type.clone());
        self.types.insert(event_type, resolved::<E>());
        self
    }

    /// Additionally decode `legacy_name` as `E`. New events are still written
    /// under the registered name.
    pub fn alias<E: Event>(mut self, legacy_name: impl Into<String>) -> Self {
        self.types.insert(legacy_name.into(), resolved::<E>());
        self
    }

    pub fn is_registered<E: Event>(&self) -> bool {
        self.names.contains_key(&TypeId::of::<E>())
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl EventTypeResolver for EventTypeRegistry {
    fn event_type_for(&self, type_id: TypeId, _rust_type_name: &'static str) -> Option<String> {
        self.names.get(&type_id).cloned()
    }

    fn resolve(&self, event_type: &str) -> Option<ResolvedEventType> {
        self.types.get(event_type).copied()
    }
}

fn resolved<E: Event>() -> ResolvedEventType {
    ResolvedEventType {
        type_id: TypeId::of::<E>(),
        rust_type_name: type_name::<E>(),
        decode: decode::<E>,
    }
}

fn decode<E: Event>(payload: JsonValue) -> Result<Box<dyn DomainEvent>, serde_json::Error> {
    let event: E = serde_json::from_value(payload)?;
    Ok(Box::new(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ItemRenamed {
        name: String,
    }

    impl Event for ItemRenamed {}

    #[test]
    fn register_uses_rust_type_name() {
        let registry = EventTypeRegistry::new().register::<ItemRenamed>();
        let name = registry
            .event_type_for(TypeId::of::<ItemRenamed>(), type_name::<ItemRenamed>())
            .unwrap();

        assert_eq!(name, type_name::<ItemRenamed>());
        assert_eq!(registry.resolve(&name).unwrap().type_id, TypeId::of::<ItemRenamed>());
    }

    #[test]
    fn alias_resolves_but_is_never_written() {
        let registry = EventTypeRegistry::new()
            .register_as::<ItemRenamed>("inventory.item.renamed.v2")
            .alias::<ItemRenamed>("inventory.item.renamed");

        let written = registry
            .event_type_for(TypeId::of::<ItemRenamed>(), type_name::<ItemRenamed>())
            .unwrap();
        assert_eq!(written, "inventory.item.renamed.v2");

        let legacy = registry.resolve("inventory.item.renamed").unwrap();
        let decoded = (legacy.decode)(serde_json::json!({ "name": "bolt" })).unwrap();
        assert_eq!(
            decoded.downcast_ref::<ItemRenamed>(),
            Some(&ItemRenamed { name: "bolt".into() })
        );
    }

    #[test]
    fn unregistered_types_have_no_event_type() {
        let registry = EventTypeRegistry::new();
        assert_eq!(
            registry.event_type_for(TypeId::of::<ItemRenamed>(), type_name::<ItemRenamed>()),
            None
        );
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let registry = EventTypeRegistry::new().register::<ItemRenamed>();
        assert!(registry.resolve("nope").is_none());
    }
}
