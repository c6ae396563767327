//! Publisher that turns committed events into catch-up jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use chronicle_events::RawEvent;

use crate::event_store::EventPublisher;
use crate::projections::ProjectionManager;

use super::queue::{JobQueue, JobQueueError};
use super::types::CatchUpJob;

/// Collects the listeners interested in committed events and, on
/// [`flush`](Self::flush), enqueues one catch-up job per listener.
///
/// Publishing happens inside `EventStore::append`, so it only records
/// work; nothing is enqueued until the caller flushes (typically once its
/// unit of work is done).
pub struct DeferredCatchUpPublisher {
    queue: Arc<dyn JobQueue>,
    /// event type → listener ids
    subscriptions: RwLock<BTreeMap<String, Vec<String>>>,
    /// (event store id, listener id)
    pending: Mutex<BTreeSet<(String, String)>>,
}

impl DeferredCatchUpPublisher {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self {
            queue,
            subscriptions: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Replace the event type → listener ids table.
    pub fn set_subscriptions(&self, subscriptions: BTreeMap<String, Vec<String>>) {
        match self.subscriptions.write() {
            Ok(mut guard) => *guard = subscriptions,
            Err(poisoned) => *poisoned.into_inner() = subscriptions,
        }
    }

    /// Take the subscriptions of every listener registered on `manager`.
    pub fn subscribe_manager(&self, manager: &ProjectionManager) {
        self.set_subscriptions(manager.subscriptions());
    }

    /// (event store id, listener id) pairs waiting for a flush.
    pub fn pending(&self) -> Vec<(String, String)> {
        self.pending
            .lock()
            .map(|pending| pending.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Enqueue one job per pending listener. Returns the number of jobs
    /// actually added (pending duplicates in the queue are not counted).
    pub fn flush(&self) -> Result<usize, JobQueueError> {
        let pending = match self.pending.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        let mut enqueued = 0;
        let mut remaining = pending.into_iter();
        while let Some((event_store_id, listener_id)) = remaining.next() {
            match self
                .queue
                .enqueue(CatchUpJob::new(listener_id.clone(), event_store_id.clone()))
            {
                Ok(true) => enqueued += 1,
                Ok(false) => {}
                Err(err) => {
                    // Keep what was not enqueued for the next flush.
                    if let Ok(mut guard) = self.pending.lock() {
                        guard.insert((event_store_id, listener_id));
                        guard.extend(remaining);
                    }
                    return Err(err);
                }
            }
        }

        debug!(enqueued, "flushed catch-up jobs");
        Ok(enqueued)
    }
}

impl EventPublisher for DeferredCatchUpPublisher {
    fn publish(&self, event_store_id: &str, events: &[RawEvent]) {
        let subscriptions = match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(event_store_id, "subscriptions lock poisoned; events not scheduled");
                return;
            }
        };
        let Ok(mut pending) = self.pending.lock() else {
            warn!(event_store_id, "pending lock poisoned; events not scheduled");
            return;
        };

        for event in events {
            if let Some(listeners) = subscriptions.get(event.event_type()) {
                for listener_id in listeners {
                    pending.insert((event_store_id.to_string(), listener_id.clone()));
                }
            }
        }
    }
}

impl core::fmt::Debug for DeferredCatchUpPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredCatchUpPublisher")
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobQueue;
    use chrono::Utc;
    use chronicle_core::{EventId, StreamName};
    use serde_json::Map;

    fn raw(sequence_number: u64, event_type: &str) -> RawEvent {
        RawEvent::new(
            sequence_number,
            event_type.to_string(),
            Map::new(),
            Map::new(),
            StreamName::new("Inventory:item-1").unwrap(),
            sequence_number,
            EventId::new(),
            Utc::now(),
        )
    }

    fn publisher() -> (Arc<InMemoryJobQueue>, DeferredCatchUpPublisher) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let publisher = DeferredCatchUpPublisher::new(queue.clone());
        publisher.set_subscriptions(BTreeMap::from([
            ("ItemReceived".to_string(), vec!["stock".to_string(), "valuation".to_string()]),
            ("ItemShipped".to_string(), vec!["stock".to_string()]),
        ]));
        (queue, publisher)
    }

    #[test]
    fn publish_only_records_interested_listeners() {
        let (queue, publisher) = publisher();

        publisher.publish("inventory", &[raw(1, "ItemShipped"), raw(2, "PriceChanged")]);

        assert_eq!(
            publisher.pending(),
            vec![("inventory".to_string(), "stock".to_string())]
        );
        assert_eq!(queue.pending().unwrap(), 0);
    }

    #[test]
    fn flush_enqueues_one_job_per_listener() {
        let (queue, publisher) = publisher();

        publisher.publish("inventory", &[raw(1, "ItemReceived"), raw(2, "ItemShipped")]);
        publisher.publish("inventory", &[raw(3, "ItemShipped")]);

        assert_eq!(publisher.flush().unwrap(), 2);
        assert_eq!(queue.pending().unwrap(), 2);
        assert!(publisher.pending().is_empty());

        // Nothing new to flush.
        assert_eq!(publisher.flush().unwrap(), 0);
    }
}
