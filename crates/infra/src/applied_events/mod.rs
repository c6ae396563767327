//! Durable per-listener progress with exclusive reservations.
//!
//! Every listener has one entry: its id and the highest global sequence number
//! it has applied (`None` until the first event is applied). A catch-up run
//! holds a [`Reservation`] on the entry for its whole duration, which is what
//! keeps two runs of the same listener from interleaving.
//!
//! ## Entry Lifecycle
//!
//! `uninitialized → initialized → reserved → initialized`
//!
//! - `initialize()` creates the entry if missing (idempotent)
//! - `reserve()` waits a bounded time for exclusive access
//! - `Reservation::save()` persists progress immediately, one event at a time
//! - `Reservation::release()` (or dropping the guard) ends the reservation

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

pub use in_memory::InMemoryAppliedEventsLog;
pub use postgres::PostgresAppliedEventsLog;

#[derive(Debug, Error)]
pub enum AppliedEventsLogError {
    /// The entry is missing or another run holds it past the wait timeout.
    #[error("reservation for listener '{listener_id}' not acquired: {reason}")]
    ReservationNotAcquired { listener_id: String, reason: String },

    #[error("listener '{listener_id}' cannot move its mark back from {current} to {requested}")]
    NonMonotonicMark {
        listener_id: String,
        current: u64,
        requested: u64,
    },

    #[error("applied events log storage error: {0}")]
    Storage(String),
}

impl AppliedEventsLogError {
    pub(crate) fn not_acquired(listener_id: &str, reason: impl Into<String>) -> Self {
        Self::ReservationNotAcquired {
            listener_id: listener_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_not_acquired(&self) -> bool {
        matches!(self, Self::ReservationNotAcquired { .. })
    }
}

/// Store of listener high-water marks.
#[async_trait]
pub trait AppliedEventsLog: Send + Sync {
    /// Create the entry for `listener_id` with no mark; no-op if it exists.
    async fn initialize(&self, listener_id: &str) -> Result<(), AppliedEventsLogError>;

    /// Take exclusive hold of the entry, waiting at most the configured timeout.
    async fn reserve(&self, listener_id: &str) -> Result<Box<dyn Reservation>, AppliedEventsLogError>;

    /// Current mark without reserving; `Ok(None)` also for unknown listeners.
    async fn highest_applied(&self, listener_id: &str) -> Result<Option<u64>, AppliedEventsLogError>;

    /// Create the backing schema if it does not exist yet.
    async fn setup(&self) -> Result<(), AppliedEventsLogError> {
        Ok(())
    }
}

/// Exclusive hold over one listener's entry.
///
/// Dropping an unreleased reservation releases it as well.
#[async_trait]
pub trait Reservation: Send {
    fn listener_id(&self) -> &str;

    /// Highest applied sequence number, `None` if nothing was applied yet.
    fn highest_applied(&self) -> Option<u64>;

    /// Persist `sequence_number` as the new mark. Marks never move backwards.
    async fn save(&mut self, sequence_number: u64) -> Result<(), AppliedEventsLogError>;

    /// Forget all progress; the next catch-up starts from the first event.
    async fn reset(&mut self) -> Result<(), AppliedEventsLogError>;

    async fn release(&mut self) -> Result<(), AppliedEventsLogError>;
}

/// Rejects a mark lower than the current one.
pub(crate) fn check_monotonic(
    listener_id: &str,
    current: Option<u64>,
    requested: u64,
) -> Result<(), AppliedEventsLogError> {
    match current {
        Some(current) if requested < current => Err(AppliedEventsLogError::NonMonotonicMark {
            listener_id: listener_id.to_string(),
            current,
            requested,
        }),
        _ => Ok(()),
    }
}
