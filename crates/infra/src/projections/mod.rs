//! Registry of listeners and projectors for one event store.
//!
//! Projections are:
//! - **Rebuildable**: a projector can be reset and replayed from the first event
//! - **Resumable**: progress is tracked per listener in the applied-events log
//! - **Exclusive**: at most one catch-up run per listener at a time

pub mod manager;

pub use manager::{ListenerInfo, ProjectionError, ProjectionManager};
