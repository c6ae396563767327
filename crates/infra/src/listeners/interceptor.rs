use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, debug_span, warn};

use chronicle_events::{EventEnvelope, HandlerResult};

/// What an interceptor knows about the event being applied.
#[derive(Debug, Clone, Copy)]
pub struct ApplyContext<'a> {
    pub listener_id: &'a str,
    pub envelope: &'a EventEnvelope,
}

/// Cross-cutting behaviour wrapped around every handled event.
///
/// Interceptors are composed once into an `EventApplier`; the first one
/// registered is the outermost. An interceptor must call `next` exactly once
/// to let the event reach the listener, and should return its result.
pub trait ApplyInterceptor: Send + Sync {
    fn intercept(
        &self,
        ctx: &ApplyContext<'_>,
        next: &mut dyn FnMut() -> HandlerResult,
    ) -> HandlerResult;
}

/// Runs `core` inside `interceptors`, outermost first.
pub(crate) fn run_chain(
    interceptors: &[Arc<dyn ApplyInterceptor>],
    ctx: &ApplyContext<'_>,
    core: &mut dyn FnMut() -> HandlerResult,
) -> HandlerResult {
    match interceptors.split_first() {
        None => core(),
        Some((outer, rest)) => outer.intercept(ctx, &mut || run_chain(rest, ctx, &mut *core)),
    }
}

/// Emits a debug span per applied event and logs handler failures.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterceptor;

impl ApplyInterceptor for TracingInterceptor {
    fn intercept(
        &self,
        ctx: &ApplyContext<'_>,
        next: &mut dyn FnMut() -> HandlerResult,
    ) -> HandlerResult {
        let raw = ctx.envelope.raw();
        let span = debug_span!(
            "apply_event",
            listener_id = ctx.listener_id,
            sequence_number = raw.sequence_number(),
            event_type = raw.event_type(),
            stream = %raw.stream_name(),
        );
        let _entered = span.enter();

        let started = Instant::now();
        let result = next();
        let elapsed_us = started.elapsed().as_micros() as u64;

        match &result {
            Ok(()) => debug!(elapsed_us, "event applied"),
            Err(err) => warn!(elapsed_us, error = %err, "event handler failed"),
        }
        result
    }
}
