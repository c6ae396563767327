//! Catch-up scheduling.
//!
//! Committed events flow into a [`DeferredCatchUpPublisher`], which is
//! flushed into a [`JobQueue`] as one [`CatchUpJob`] per interested listener.
//! A [`CatchUpWorker`] drains the queue and runs the jobs with retries.

pub mod publisher;
pub mod queue;
pub mod types;
pub mod worker;

pub use publisher::DeferredCatchUpPublisher;
pub use queue::{InMemoryJobQueue, JobQueue, JobQueueError};
pub use types::{BackoffStrategy, CatchUpJob, DeadLetterEntry, RetryPolicy};
pub use worker::{CatchUpWorker, CatchUpWorkerConfig, JobDisposition, WorkerHandle, WorkerStats};
