use std::any::{TypeId, type_name};
use std::collections::HashMap;

use crate::envelope::EventEnvelope;
use crate::event::Event;
use crate::raw_event::RawEvent;

/// Result returned by listener handlers and hooks.
///
/// Any error aborts the current catch-up run; the event is not marked as applied.
pub type HandlerResult = anyhow::Result<()>;

type BoxedHandler<L> = Box<dyn Fn(&mut L, &EventEnvelope) -> HandlerResult + Send + Sync>;

struct RegisteredHandler<L> {
    rust_type_name: &'static str,
    handler: BoxedHandler<L>,
}

/// Handler table of a listener, keyed by Rust event type.
///
/// Built once per listener type via [`EventListener::handlers`]:
///
/// ```ignore
/// EventHandlers::new()
///     .on::<ItemCreated>(|stock, event, _raw| { stock.create(event); Ok(()) })
///     .on(StockProjector::when_adjusted)
/// ```
///
/// Registering a second handler for the same type replaces the first.
pub struct EventHandlers<L> {
    handlers: HashMap<TypeId, RegisteredHandler<L>>,
}

impl<L: 'static> EventHandlers<L> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: Event,
        F: Fn(&mut L, &E, &RawEvent) -> HandlerResult + Send + Sync + 'static,
    {
        let boxed: BoxedHandler<L> = Box::new(move |listener: &mut L, envelope: &EventEnvelope| {
            let event = envelope.downcast_ref::<E>().ok_or_else(|| {
                anyhow::anyhow!(
                    "handler for {} received {}",
                    type_name::<E>(),
                    envelope.event().rust_type_name()
                )
            })?;
            handler(listener, event, envelope.raw())
        });

        self.handlers.insert(
            TypeId::of::<E>(),
            RegisteredHandler {
                rust_type_name: type_name::<E>(),
                handler: boxed,
            },
        );
        self
    }

    pub fn handles(&self, type_id: TypeId) -> bool {
        self.handlers.contains_key(&type_id)
    }

    /// `(TypeId, Rust type name)` of every handled event type.
    pub fn handled_types(&self) -> impl Iterator<Item = (TypeId, &'static str)> + '_ {
        self.handlers
            .iter()
            .map(|(type_id, registered)| (*type_id, registered.rust_type_name))
    }

    /// Run the handler registered for the envelope's event type.
    ///
    /// Returns `None` when the listener does not handle that type.
    pub fn dispatch(&self, listener: &mut L, envelope: &EventEnvelope) -> Option<HandlerResult> {
        self.handlers
            .get(&envelope.event().event_type_id())
            .map(|registered| (registered.handler)(listener, envelope))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<L: 'static> Default for EventHandlers<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L> core::fmt::Debug for EventHandlers<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.handlers.values().map(|r| r.rust_type_name))
            .finish()
    }
}

/// A named consumer of stored events.
///
/// Listeners are driven by the catch-up invoker, which delivers every stored
/// event after the listener's high-water mark, in global sequence order.
///
/// ## Identity
///
/// `listener_id` must be stable across deployments: the applied-events log
/// stores progress under it. Renaming a listener makes it start from scratch.
///
/// ## Delivery
///
/// - Only event types with a registered handler are delivered; others are
///   skipped but still advance the high-water mark.
/// - Delivery is at-least-once: a crash between applying an event and saving
///   the mark re-delivers that event. Handlers should be idempotent.
/// - The invoker holds an exclusive reservation while delivering, so one
///   listener id never runs concurrently with itself.
///
/// ## Hooks
///
/// `before_invoke` and `after_invoke` wrap every handled event. An error from
/// either counts as a handler failure.
pub trait EventListener: Send + 'static {
    fn listener_id(&self) -> &str;

    fn handlers() -> EventHandlers<Self>
    where
        Self: Sized;

    fn before_invoke(&mut self, _envelope: &EventEnvelope) -> HandlerResult {
        Ok(())
    }

    fn after_invoke(&mut self, _envelope: &EventEnvelope) -> HandlerResult {
        Ok(())
    }
}

/// An [`EventListener`] that maintains a disposable read model.
///
/// Read models can be deleted and rebuilt from events at any time: `reset`
/// clears the model, after which a replay rebuilds it from the first event.
pub trait Projector: EventListener {
    fn reset(&mut self) -> HandlerResult;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DomainEvent;
    use chronicle_core::{EventId, StreamName};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl Event for Deposited {}

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Frozen;

    impl Event for Frozen {}

    #[derive(Default)]
    struct Balance {
        total: i64,
        applied: Vec<u64>,
    }

    impl Balance {
        fn when_deposited(&mut self, event: &Deposited, raw: &RawEvent) -> HandlerResult {
            self.total += event.amount;
            self.applied.push(raw.sequence_number());
            Ok(())
        }
    }

    impl EventListener for Balance {
        fn listener_id(&self) -> &str {
            "balance"
        }

        fn handlers() -> EventHandlers<Self> {
            EventHandlers::new().on(Balance::when_deposited)
        }
    }

    fn envelope(event: Box<dyn DomainEvent>, sequence_number: u64) -> EventEnvelope {
        let raw = RawEvent::new(
            sequence_number,
            event.rust_type_name(),
            Default::default(),
            Default::default(),
            StreamName::new("Account:1").unwrap(),
            sequence_number,
            EventId::new(),
            Utc::now(),
        );
        EventEnvelope::new(event, raw)
    }

    #[test]
    fn dispatches_to_the_handler_for_the_event_type() {
        let handlers = Balance::handlers();
        let mut balance = Balance::default();

        let outcome = handlers.dispatch(&mut balance, &envelope(Box::new(Deposited { amount: 5 }), 3));

        assert!(matches!(outcome, Some(Ok(()))));
        assert_eq!(balance.total, 5);
        assert_eq!(balance.applied, vec![3]);
    }

    #[test]
    fn unhandled_types_are_not_dispatched() {
        let handlers = Balance::handlers();
        let mut balance = Balance::default();

        assert!(handlers.dispatch(&mut balance, &envelope(Box::new(Frozen), 1)).is_none());
        assert!(!handlers.handles(TypeId::of::<Frozen>()));
        assert_eq!(handlers.len(), 1);
    }

    #[test]
    fn handler_errors_are_returned() {
        let handlers = EventHandlers::<Balance>::new()
            .on::<Frozen, _>(|_, _, _| Err(anyhow::anyhow!("account frozen")));
        let mut balance = Balance::default();

        let outcome = handlers.dispatch(&mut balance, &envelope(Box::new(Frozen), 1));

        assert_eq!(outcome.unwrap().unwrap_err().to_string(), "account frozen");
    }
}
