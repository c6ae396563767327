use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use chronicle_core::EventId;
use chronicle_events::{EventListener, HandlerResult};

use super::applier::{ApplyOutcome, EventApplier};
use super::interceptor::ApplyInterceptor;
use crate::applied_events::{AppliedEventsLog, AppliedEventsLogError, Reservation};
use crate::event_store::{EventStore, EventStoreError};

/// Catch-up errors.
#[derive(Debug, Error)]
pub enum CatchUpError {
    /// Another run holds the listener, or the listener could not be initialized.
    #[error("listener '{listener_id}' could not be reserved: {reason}")]
    ReservationNotAcquired { listener_id: String, reason: String },

    #[error(
        "listener '{listener_id}' failed to apply event {event_id} ({event_type}) at sequence number {sequence_number}"
    )]
    EventCouldNotBeApplied {
        event_id: EventId,
        event_type: String,
        listener_id: String,
        sequence_number: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("listener '{listener_id}' could not reset its state")]
    ResetFailed {
        listener_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Log(AppliedEventsLogError),
}

impl CatchUpError {
    /// Losing the race for a reservation is normal operation, not a failure
    /// anyone needs to be alerted about.
    pub fn is_contention(&self) -> bool {
        matches!(self, CatchUpError::ReservationNotAcquired { .. })
    }
}

impl From<AppliedEventsLogError> for CatchUpError {
    fn from(err: AppliedEventsLogError) -> Self {
        match err {
            AppliedEventsLogError::ReservationNotAcquired { listener_id, reason } => {
                CatchUpError::ReservationNotAcquired { listener_id, reason }
            }
            other => CatchUpError::Log(other),
        }
    }
}

/// Summary of one successful catch-up run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpOutcome {
    pub listener_id: String,
    /// Events delivered to a handler.
    pub applied: u64,
    /// Events passed over because the listener does not handle their type.
    pub skipped: u64,
    /// Mark after the run.
    pub highest_applied: Option<u64>,
}

/// Progress notification, sent after each event's mark is saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpProgress<'a> {
    pub listener_id: &'a str,
    pub sequence_number: u64,
    pub outcome: ApplyOutcome,
}

pub type ProgressCallback = Arc<dyn Fn(&CatchUpProgress<'_>) + Send + Sync>;

/// Clears a listener's derived state before a replay (usually `Projector::reset`).
pub type ResetFn<L> = fn(&mut L) -> HandlerResult;

enum RunMode<L> {
    CatchUp,
    Replay { reset_state: Option<ResetFn<L>> },
}

/// Brings one listener type up to date with the event store.
///
/// ## Catch-up Protocol
///
/// 1. Initialize the listener's applied-events entry (idempotent)
/// 2. Reserve it; a busy listener yields [`CatchUpError::ReservationNotAcquired`]
/// 3. Load every event after the listener's mark, in sequence order
/// 4. Apply each event and save its sequence number before moving on
/// 5. Release the reservation, whatever the outcome
///
/// A failing event stops the run with nothing saved for it, so the next run
/// starts exactly at that event.
pub struct EventListenerInvoker<L> {
    store: EventStore,
    log: Arc<dyn AppliedEventsLog>,
    applier: EventApplier<L>,
    progress: Option<ProgressCallback>,
}

impl<L: EventListener> EventListenerInvoker<L> {
    pub fn new(store: EventStore, log: Arc<dyn AppliedEventsLog>) -> Self {
        let applier = EventApplier::new(store.normalizer().clone());
        Self {
            store,
            log,
            applier,
            progress: None,
        }
    }

    pub fn with_interceptor(mut self, interceptor: Arc<dyn ApplyInterceptor>) -> Self {
        self.applier = self.applier.with_interceptor(interceptor);
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn applier(&self) -> &EventApplier<L> {
        &self.applier
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// Apply every event the listener has not seen yet.
    pub async fn catch_up(&self, listener: &mut L) -> Result<CatchUpOutcome, CatchUpError> {
        self.run(listener, RunMode::CatchUp).await
    }

    /// Forget the listener's progress and apply the whole log again.
    ///
    /// Only the mark is reset; see [`replay_with_reset`](Self::replay_with_reset)
    /// to clear derived state as well.
    pub async fn replay(&self, listener: &mut L) -> Result<CatchUpOutcome, CatchUpError> {
        self.run(listener, RunMode::Replay { reset_state: None }).await
    }

    /// Like [`replay`](Self::replay), but first calls `reset_state` while the
    /// reservation is held. If it fails, the mark is left untouched.
    pub async fn replay_with_reset(
        &self,
        listener: &mut L,
        reset_state: ResetFn<L>,
    ) -> Result<CatchUpOutcome, CatchUpError> {
        self.run(
            listener,
            RunMode::Replay {
                reset_state: Some(reset_state),
            },
        )
        .await
    }

    async fn run(&self, listener: &mut L, mode: RunMode<L>) -> Result<CatchUpOutcome, CatchUpError> {
        let listener_id = listener.listener_id().to_string();

        self.log.initialize(&listener_id).await?;

        let mut reservation = match self.log.reserve(&listener_id).await {
            Ok(reservation) => reservation,
            Err(err) => {
                let err = CatchUpError::from(err);
                if err.is_contention() {
                    debug!(listener_id = %listener_id, error = %err, "listener busy, skipping catch-up");
                }
                return Err(err);
            }
        };

        let result = self
            .apply_pending(listener, &listener_id, reservation.as_mut(), mode)
            .await;
        let released = reservation.release().await;

        match (result, released) {
            (Ok(outcome), Ok(())) => {
                info!(
                    listener_id = %listener_id,
                    event_store_id = %self.store.id(),
                    applied = outcome.applied,
                    skipped = outcome.skipped,
                    highest_applied = ?outcome.highest_applied,
                    "catch-up finished"
                );
                Ok(outcome)
            }
            (Ok(_), Err(release_err)) => Err(release_err.into()),
            (Err(err), Err(release_err)) => {
                warn!(listener_id = %listener_id, error = %release_err, "failed to release reservation");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    async fn apply_pending(
        &self,
        listener: &mut L,
        listener_id: &str,
        reservation: &mut dyn Reservation,
        mode: RunMode<L>,
    ) -> Result<CatchUpOutcome, CatchUpError> {
        if let RunMode::Replay { reset_state } = mode {
            if let Some(reset_state) = reset_state {
                reset_state(listener).map_err(|source| CatchUpError::ResetFailed {
                    listener_id: listener_id.to_string(),
                    source: source.into(),
                })?;
            }
            reservation.reset().await?;
            info!(listener_id, "listener reset for replay");
        }

        let mark = reservation.highest_applied();
        let mut outcome = CatchUpOutcome {
            listener_id: listener_id.to_string(),
            applied: 0,
            skipped: 0,
            highest_applied: mark,
        };

        let pending = self
            .store
            .storage()
            .load_all(mark.map_or(1, |m| m + 1))
            .await?;

        for item in pending {
            let raw = item?;
            let sequence_number = raw.sequence_number();
            let event_id = raw.id();
            let event_type = raw.event_type().to_string();

            let applied = match self.applier.apply(listener, raw) {
                Ok(applied) => applied,
                Err(source) => {
                    warn!(
                        listener_id,
                        sequence_number,
                        event_type = %event_type,
                        error = %source,
                        "event could not be applied"
                    );
                    return Err(CatchUpError::EventCouldNotBeApplied {
                        event_id,
                        event_type,
                        listener_id: listener_id.to_string(),
                        sequence_number,
                        source: source.into(),
                    });
                }
            };

            reservation.save(sequence_number).await?;
            outcome.highest_applied = Some(sequence_number);
            match applied {
                ApplyOutcome::Applied => outcome.applied += 1,
                ApplyOutcome::Skipped => outcome.skipped += 1,
            }

            if let Some(progress) = &self.progress {
                progress(&CatchUpProgress {
                    listener_id,
                    sequence_number,
                    outcome: applied,
                });
            }
        }

        Ok(outcome)
    }
}

impl<L> core::fmt::Debug for EventListenerInvoker<L> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventListenerInvoker")
            .field("store", &self.store)
            .field("applier", &self.applier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_reservation_failures_count_as_contention() {
        let busy = CatchUpError::from(AppliedEventsLogError::ReservationNotAcquired {
            listener_id: "stock".into(),
            reason: "still reserved".into(),
        });
        let broken = CatchUpError::from(AppliedEventsLogError::Storage("down".into()));

        assert!(busy.is_contention());
        assert!(!broken.is_contention());
        assert!(matches!(broken, CatchUpError::Log(_)));
    }

    #[test]
    fn handler_failure_keeps_its_source() {
        let err = CatchUpError::EventCouldNotBeApplied {
            event_id: EventId::new(),
            event_type: "inventory.item.created".into(),
            listener_id: "stock".into(),
            sequence_number: 6,
            source: anyhow::anyhow!("disk full").into(),
        };

        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "disk full");
        assert!(err.to_string().contains("sequence number 6"));
    }
}
