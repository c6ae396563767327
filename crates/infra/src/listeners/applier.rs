use std::sync::Arc;

use chronicle_events::{
    EventEnvelope, EventHandlers, EventListener, EventNormalizer, HandlerResult, RawEvent,
};

use tracing::warn;

use super::interceptor::{ApplyContext, ApplyInterceptor, run_chain};

/// What happened to one event offered to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Unknown event type, or a type the listener has no handler for.
    Skipped,
}

/// Delivers single stored events to a listener.
///
/// Holds the listener's handler table (built once, from
/// [`EventListener::handlers`]) and the interceptor chain. Events are only
/// decoded when the listener handles their type.
pub struct EventApplier<L> {
    handlers: EventHandlers<L>,
    interceptors: Vec<Arc<dyn ApplyInterceptor>>,
    normalizer: EventNormalizer,
}

impl<L: EventListener> EventApplier<L> {
    pub fn new(normalizer: EventNormalizer) -> Self {
        let applier = Self {
            handlers: L::handlers(),
            interceptors: Vec::new(),
            normalizer,
        };
        for rust_type in applier.unnamed_handler_types() {
            warn!(
                listener = std::any::type_name::<L>(),
                event_type = rust_type,
                "handler registered for an event type the resolver cannot name; it will never run"
            );
        }
        applier
    }

    /// Add an interceptor inside the ones already registered.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ApplyInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn handlers(&self) -> &EventHandlers<L> {
        &self.handlers
    }

    /// Stored event-type names this listener handles.
    pub fn handled_event_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .handled_types()
            .filter_map(|(type_id, rust_type_name)| {
                self.normalizer
                    .resolver()
                    .event_type_for(type_id, rust_type_name)
            })
            .collect();
        names.sort();
        names
    }

    /// Rust types the listener handles but the resolver has no stored name
    /// for. Events of these types can neither be appended nor delivered.
    pub fn unnamed_handler_types(&self) -> Vec<&'static str> {
        let resolver = self.normalizer.resolver();
        let mut unnamed: Vec<&'static str> = self
            .handlers
            .handled_types()
            .filter(|(type_id, rust_type_name)| {
                resolver.event_type_for(*type_id, rust_type_name).is_none()
            })
            .map(|(_, rust_type_name)| rust_type_name)
            .collect();
        unnamed.sort_unstable();
        unnamed
    }

    /// Offer one stored event to `listener`.
    ///
    /// Runs the interceptor chain around `before_invoke`, the handler and
    /// `after_invoke`. Any error (including a payload that no longer decodes)
    /// is returned as is.
    pub fn apply(&self, listener: &mut L, raw: RawEvent) -> anyhow::Result<ApplyOutcome> {
        let Some(resolved) = self.normalizer.resolver().resolve(raw.event_type()) else {
            return Ok(ApplyOutcome::Skipped);
        };
        if !self.handlers.handles(resolved.type_id) {
            return Ok(ApplyOutcome::Skipped);
        }

        let event = self.normalizer.denormalize(raw.payload(), raw.event_type())?;
        let envelope = EventEnvelope::new(event, raw);
        let listener_id = listener.listener_id().to_string();
        let ctx = ApplyContext {
            listener_id: &listener_id,
            envelope: &envelope,
        };

        let handlers = &self.handlers;
        let mut invoke = || -> HandlerResult {
            listener.before_invoke(&envelope)?;
            if let Some(result) = handlers.dispatch(&mut *listener, &envelope) {
                result?;
            }
            listener.after_invoke(&envelope)
        };

        run_chain(&self.interceptors, &ctx, &mut invoke)?;
        Ok(ApplyOutcome::Applied)
    }
}

impl<L> core::fmt::Debug for EventApplier<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventApplier")
            .field("handlers", &self.handlers)
            .field("interceptors", &self.interceptors.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::{EventId, StreamName};
    use chronicle_events::{Event, EventTypeRegistry};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Opened {
        owner: String,
    }
    impl Event for Opened {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Closed;
    impl Event for Closed {}

    #[derive(Default)]
    struct Accounts {
        trail: Vec<String>,
    }

    impl EventListener for Accounts {
        fn listener_id(&self) -> &str {
            "accounts"
        }

        fn handlers() -> EventHandlers<Self> {
            EventHandlers::new().on::<Opened, _>(|accounts: &mut Accounts, event, _| {
                accounts.trail.push(format!("opened:{}", event.owner));
                Ok(())
            })
        }

        fn before_invoke(&mut self, _envelope: &EventEnvelope) -> HandlerResult {
            self.trail.push("before".into());
            Ok(())
        }

        fn after_invoke(&mut self, _envelope: &EventEnvelope) -> HandlerResult {
            self.trail.push("after".into());
            Ok(())
        }
    }

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(
            EventTypeRegistry::new()
                .register_as::<Opened>("account.opened")
                .register_as::<Closed>("account.closed"),
        )
    }

    fn raw(event_type: &str, payload: serde_json::Value) -> RawEvent {
        let serde_json::Value::Object(payload) = payload else {
            panic!("payload must be an object");
        };
        RawEvent::new(
            1,
            event_type,
            payload,
            Default::default(),
            StreamName::new("Account:1").unwrap(),
            1,
            EventId::new(),
            Utc::now(),
        )
    }

    #[test]
    fn hooks_wrap_the_handler() {
        let applier = EventApplier::<Accounts>::new(normalizer());
        let mut accounts = Accounts::default();

        let outcome = applier
            .apply(&mut accounts, raw("account.opened", serde_json::json!({ "owner": "ada" })))
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(accounts.trail, vec!["before", "opened:ada", "after"]);
    }

    #[test]
    fn unhandled_and_unknown_types_are_skipped_without_hooks() {
        let applier = EventApplier::<Accounts>::new(normalizer());
        let mut accounts = Accounts::default();

        let closed = applier.apply(&mut accounts, raw("account.closed", serde_json::json!({})));
        let unknown = applier.apply(&mut accounts, raw("account.merged", serde_json::json!({})));

        assert_eq!(closed.unwrap(), ApplyOutcome::Skipped);
        assert_eq!(unknown.unwrap(), ApplyOutcome::Skipped);
        assert!(accounts.trail.is_empty());
    }

    #[test]
    fn undecodable_payload_of_a_handled_type_is_an_error() {
        let applier = EventApplier::<Accounts>::new(normalizer());
        let mut accounts = Accounts::default();

        let result = applier.apply(&mut accounts, raw("account.opened", serde_json::json!({ "owner": 7 })));

        assert!(result.is_err());
        assert!(accounts.trail.is_empty());
    }

    #[test]
    fn reports_handled_wire_names() {
        let applier = EventApplier::<Accounts>::new(normalizer());
        assert_eq!(applier.handled_event_types(), vec!["account.opened".to_string()]);
    }

    #[test]
    fn handlers_for_unregistered_types_are_reported() {
        let applier = EventApplier::<Accounts>::new(EventNormalizer::new(
            EventTypeRegistry::new().register_as::<Closed>("account.closed"),
        ));

        assert_eq!(applier.unnamed_handler_types(), vec![std::any::type_name::<Opened>()]);
        assert!(applier.handled_event_types().is_empty());
        assert!(EventApplier::<Accounts>::new(normalizer()).unnamed_handler_types().is_empty());
    }
}
