//! Queue of pending catch-up jobs.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use thiserror::Error;

use super::types::{CatchUpJob, DeadLetterEntry};

#[derive(Debug, Clone, Error)]
pub enum JobQueueError {
    #[error("storage error: {0}")]
    Storage(String),
}

/// Transport of catch-up jobs between publishers and workers.
pub trait JobQueue: Send + Sync {
    /// Add a job. Returns `false` when an equivalent job (same event store
    /// and listener) is already pending and the new one was dropped.
    fn enqueue(&self, job: CatchUpJob) -> Result<bool, JobQueueError>;

    /// Take the oldest job that is ready to run.
    fn claim_next(&self) -> Result<Option<CatchUpJob>, JobQueueError>;

    fn dead_letter(&self, job: CatchUpJob, reason: String) -> Result<(), JobQueueError>;

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, JobQueueError>;

    /// Number of pending (unclaimed) jobs.
    fn pending(&self) -> Result<usize, JobQueueError>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<CatchUpJob>,
    dead_letters: Vec<DeadLetterEntry>,
}

/// In-memory job queue for tests/dev.
///
/// A claimed job is no longer pending, so a job enqueued while another run
/// of the same listener is in flight is kept: the events that triggered it
/// may have been committed after that run loaded its events.
#[derive(Debug, Default)]
pub struct InMemoryJobQueue {
    state: Mutex<QueueState>,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, QueueState>, JobQueueError> {
        self.state
            .lock()
            .map_err(|_| JobQueueError::Storage("lock poisoned".to_string()))
    }
}

impl JobQueue for InMemoryJobQueue {
    fn enqueue(&self, job: CatchUpJob) -> Result<bool, JobQueueError> {
        let mut state = self.state()?;
        if state.pending.iter().any(|pending| pending.key() == job.key()) {
            return Ok(false);
        }
        state.pending.push_back(job);
        Ok(true)
    }

    fn claim_next(&self) -> Result<Option<CatchUpJob>, JobQueueError> {
        let mut state = self.state()?;
        let now = Utc::now();
        let position = state.pending.iter().position(|job| job.is_ready(now));
        Ok(position.and_then(|i| state.pending.remove(i)))
    }

    fn dead_letter(&self, job: CatchUpJob, reason: String) -> Result<(), JobQueueError> {
        self.state()?.dead_letters.push(DeadLetterEntry {
            job,
            reason,
            dead_lettered_at: Utc::now(),
        });
        Ok(())
    }

    fn dead_letters(&self) -> Result<Vec<DeadLetterEntry>, JobQueueError> {
        Ok(self.state()?.dead_letters.clone())
    }

    fn pending(&self) -> Result<usize, JobQueueError> {
        Ok(self.state()?.pending.len())
    }
}
