use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::{AppliedEventsLog, AppliedEventsLogError, Reservation, check_monotonic};
use crate::config::DEFAULT_RESERVATION_TIMEOUT;

#[derive(Debug, Default)]
struct Entry {
    hold: Arc<AsyncMutex<()>>,
    mark: Mutex<Option<u64>>,
}

/// In-memory applied-events log.
///
/// Reservations are owned async mutex guards, so they are only exclusive
/// within one process. Intended for tests/dev.
#[derive(Debug, Clone)]
pub struct InMemoryAppliedEventsLog {
    entries: Arc<Mutex<HashMap<String, Arc<Entry>>>>,
    reservation_timeout: Duration,
}

impl Default for InMemoryAppliedEventsLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAppliedEventsLog {
    pub fn new() -> Self {
        Self::with_reservation_timeout(DEFAULT_RESERVATION_TIMEOUT)
    }

    pub fn with_reservation_timeout(reservation_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            reservation_timeout,
        }
    }

    fn entry(&self, listener_id: &str) -> Result<Option<Arc<Entry>>, AppliedEventsLogError> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| AppliedEventsLogError::Storage("lock poisoned".to_string()))?;
        Ok(entries.get(listener_id).cloned())
    }
}

#[async_trait]
impl AppliedEventsLog for InMemoryAppliedEventsLog {
    async fn initialize(&self, listener_id: &str) -> Result<(), AppliedEventsLogError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| AppliedEventsLogError::Storage("lock poisoned".to_string()))?;
        entries.entry(listener_id.to_string()).or_default();
        Ok(())
    }

    async fn reserve(&self, listener_id: &str) -> Result<Box<dyn Reservation>, AppliedEventsLogError> {
        let entry = self
            .entry(listener_id)?
            .ok_or_else(|| AppliedEventsLogError::not_acquired(listener_id, "listener is not initialized"))?;

        let guard = tokio::time::timeout(self.reservation_timeout, entry.hold.clone().lock_owned())
            .await
            .map_err(|_| {
                AppliedEventsLogError::not_acquired(
                    listener_id,
                    format!("still reserved after {:?}", self.reservation_timeout),
                )
            })?;

        Ok(Box::new(InMemoryReservation {
            listener_id: listener_id.to_string(),
            entry,
            guard: Some(guard),
        }))
    }

    async fn highest_applied(&self, listener_id: &str) -> Result<Option<u64>, AppliedEventsLogError> {
        match self.entry(listener_id)? {
            Some(entry) => read_mark(&entry),
            None => Ok(None),
        }
    }
}

fn read_mark(entry: &Entry) -> Result<Option<u64>, AppliedEventsLogError> {
    entry
        .mark
        .lock()
        .map(|mark| *mark)
        .map_err(|_| AppliedEventsLogError::Storage("lock poisoned".to_string()))
}

fn write_mark(entry: &Entry, value: Option<u64>) -> Result<(), AppliedEventsLogError> {
    let mut mark = entry
        .mark
        .lock()
        .map_err(|_| AppliedEventsLogError::Storage("lock poisoned".to_string()))?;
    *mark = value;
    Ok(())
}

struct InMemoryReservation {
    listener_id: String,
    entry: Arc<Entry>,
    /// Dropping the guard ends the reservation.
    guard: Option<OwnedMutexGuard<()>>,
}

impl InMemoryReservation {
    fn ensure_held(&self) -> Result<(), AppliedEventsLogError> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(AppliedEventsLogError::not_acquired(&self.listener_id, "reservation already released"))
        }
    }
}

#[async_trait]
impl Reservation for InMemoryReservation {
    fn listener_id(&self) -> &str {
        &self.listener_id
    }

    fn highest_applied(&self) -> Option<u64> {
        read_mark(&self.entry).ok().flatten()
    }

    async fn save(&mut self, sequence_number: u64) -> Result<(), AppliedEventsLogError> {
        self.ensure_held()?;
        check_monotonic(&self.listener_id, read_mark(&self.entry)?, sequence_number)?;
        write_mark(&self.entry, Some(sequence_number))
    }

    async fn reset(&mut self) -> Result<(), AppliedEventsLogError> {
        self.ensure_held()?;
        write_mark(&self.entry, None)
    }

    async fn release(&mut self) -> Result<(), AppliedEventsLogError> {
        self.guard.take();
        Ok(())
    }
}
