//! Delivering stored events to listeners.

pub mod applier;
pub mod interceptor;
pub mod invoker;

pub use applier::{ApplyOutcome, EventApplier};
pub use interceptor::{ApplyContext, ApplyInterceptor, TracingInterceptor};
pub use invoker::{
    CatchUpError, CatchUpOutcome, CatchUpProgress, EventListenerInvoker, ProgressCallback,
    ResetFn,
};
