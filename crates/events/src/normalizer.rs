use std::any::TypeId;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::event::{DomainEvent, Event};
use crate::raw_event::Payload;
use crate::resolver::EventTypeResolver;

/// Normalization errors.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("event type {rust_type} cannot be normalized: {reason}")]
    UnsupportedType { rust_type: String, reason: String },

    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    #[error("payload for '{event_type}' could not be denormalized: {source}")]
    Denormalization {
        event_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A domain event reduced to what the storage persists.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    pub event_type: String,
    pub payload: Payload,
}

/// Converts domain events to `(event_type, payload)` and back.
///
/// `denormalize(normalize(e))` yields a value equal to `e` for every
/// registered event type.
#[derive(Clone)]
pub struct EventNormalizer {
    resolver: Arc<dyn EventTypeResolver>,
}

impl EventNormalizer {
    pub fn new(resolver: impl EventTypeResolver + 'static) -> Self {
        Self {
            resolver: Arc::new(resolver),
        }
    }

    pub fn from_shared(resolver: Arc<dyn EventTypeResolver>) -> Self {
        Self { resolver }
    }

    pub fn resolver(&self) -> &dyn EventTypeResolver {
        self.resolver.as_ref()
    }

    /// Stored name of `E`, as the resolver would write it.
    pub fn event_type_of<E: Event>(&self) -> Option<String> {
        self.resolver
            .event_type_for(TypeId::of::<E>(), std::any::type_name::<E>())
    }

    pub fn normalize(&self, event: &dyn DomainEvent) -> Result<NormalizedEvent, NormalizerError> {
        let rust_type = event.rust_type_name();
        let event_type = self
            .resolver
            .event_type_for(event.event_type_id(), rust_type)
            .ok_or_else(|| NormalizerError::UnsupportedType {
                rust_type: rust_type.to_string(),
                reason: "no event type name registered".to_string(),
            })?;

        let payload = match event.to_json() {
            Ok(JsonValue::Object(map)) => map,
            Ok(other) => {
                return Err(NormalizerError::UnsupportedType {
                    rust_type: rust_type.to_string(),
                    reason: format!("payload must serialize to a JSON object, got {}", json_kind(&other)),
                });
            }
            Err(e) => {
                return Err(NormalizerError::UnsupportedType {
                    rust_type: rust_type.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        Ok(NormalizedEvent { event_type, payload })
    }

    pub fn denormalize(
        &self,
        payload: &Payload,
        event_type: &str,
    ) -> Result<Box<dyn DomainEvent>, NormalizerError> {
        let resolved = self
            .resolver
            .resolve(event_type)
            .ok_or_else(|| NormalizerError::UnknownEventType(event_type.to_string()))?;

        (resolved.decode)(JsonValue::Object(payload.clone())).map_err(|source| {
            NormalizerError::Denormalization {
                event_type: event_type.to_string(),
                source,
            }
        })
    }
}

impl core::fmt::Debug for EventNormalizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventNormalizer").finish_non_exhaustive()
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}
