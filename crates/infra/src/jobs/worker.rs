//! Background worker executing catch-up jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ChronicleConfig;
use crate::projections::{ProjectionError, ProjectionManager};

use super::queue::{JobQueue, JobQueueError};
use super::types::{CatchUpJob, RetryPolicy};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct CatchUpWorkerConfig {
    /// Polling interval when the queue is empty
    pub poll_interval: Duration,
    pub retry_policy: RetryPolicy,
    /// Worker name (for logging)
    pub name: String,
}

impl Default for CatchUpWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            retry_policy: RetryPolicy::default(),
            name: "catch-up-worker".to_string(),
        }
    }
}

impl CatchUpWorkerConfig {
    pub fn from_config(config: &ChronicleConfig) -> Self {
        Self {
            poll_interval: config.worker_poll_interval,
            retry_policy: RetryPolicy {
                max_attempts: config.worker_max_attempts,
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Counters kept by a running worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
}

/// What happened to a job the worker picked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded,
    Retried,
    DeadLettered,
}

/// Handle to control and join a background worker.
///
/// Dropping the handle also stops the worker, after its current job.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop. A job in
    /// progress is finished first. Returns the final counters.
    pub async fn shutdown(mut self) -> WorkerStats {
        let _ = self.shutdown.send(true);
        if let Err(err) = (&mut self.join).await {
            error!(error = %err, "catch-up worker task failed");
        }
        self.stats()
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

/// Pulls [`CatchUpJob`]s from a [`JobQueue`] and runs them against the
/// [`ProjectionManager`] of the job's event store.
///
/// Handler failures are retried with the configured backoff and
/// dead-lettered once out of attempts. Contention (another process holds the
/// listener) is rescheduled without using an attempt. Jobs that cannot
/// succeed (unknown store or listener) are dead-lettered.
pub struct CatchUpWorker {
    queue: Arc<dyn JobQueue>,
    managers: HashMap<String, Arc<ProjectionManager>>,
    config: CatchUpWorkerConfig,
}

impl CatchUpWorker {
    pub fn new(queue: Arc<dyn JobQueue>, config: CatchUpWorkerConfig) -> Self {
        Self {
            queue,
            managers: HashMap::new(),
            config,
        }
    }

    /// Serve jobs for the manager's event store.
    pub fn with_manager(mut self, manager: Arc<ProjectionManager>) -> Self {
        self.managers
            .insert(manager.event_store_id().to_string(), manager);
        self
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let worker_stats = stats.clone();

        let join = tokio::spawn(async move { self.run(shutdown_rx, worker_stats).await });

        WorkerHandle {
            shutdown: shutdown_tx,
            join,
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<WorkerStats>>) {
        info!(worker = %self.config.name, stores = self.managers.len(), "catch-up worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(Some(disposition)) => {
                    if let Ok(mut stats) = stats.lock() {
                        stats.jobs_processed += 1;
                        match disposition {
                            JobDisposition::Succeeded => stats.jobs_succeeded += 1,
                            JobDisposition::Retried => stats.jobs_retried += 1,
                            JobDisposition::DeadLettered => stats.jobs_dead_lettered += 1,
                        }
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "failed to claim job");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    // Handle dropped.
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.config.name, "catch-up worker stopped");
    }

    /// Claim and run at most one ready job.
    pub async fn run_once(&self) -> Result<Option<JobDisposition>, JobQueueError> {
        let Some(job) = self.queue.claim_next()? else {
            return Ok(None);
        };
        self.execute(job).await.map(Some)
    }

    async fn execute(&self, job: CatchUpJob) -> Result<JobDisposition, JobQueueError> {
        let Some(manager) = self.managers.get(&job.event_store_id) else {
            warn!(
                event_store_id = %job.event_store_id,
                listener_id = %job.listener_id,
                "no manager for event store"
            );
            let reason = format!("unknown event store `{}`", job.event_store_id);
            self.queue.dead_letter(job, reason)?;
            return Ok(JobDisposition::DeadLettered);
        };

        debug!(
            job_id = %job.id,
            listener_id = %job.listener_id,
            attempt = job.attempt,
            "running catch-up job"
        );

        match manager.catch_up(&job.listener_id).await {
            Ok(outcome) => {
                debug!(
                    listener_id = %job.listener_id,
                    applied = outcome.applied,
                    skipped = outcome.skipped,
                    "catch-up job completed"
                );
                Ok(JobDisposition::Succeeded)
            }
            Err(err @ ProjectionError::UnknownListener(_)) => {
                warn!(listener_id = %job.listener_id, error = %err, "dropping catch-up job");
                self.queue.dead_letter(job, err.to_string())?;
                Ok(JobDisposition::DeadLettered)
            }
            Err(err) => self.retry_or_dead_letter(job, err),
        }
    }

    fn retry_or_dead_letter(
        &self,
        job: CatchUpJob,
        err: ProjectionError,
    ) -> Result<JobDisposition, JobQueueError> {
        let policy = &self.config.retry_policy;

        if err.is_contention() {
            let delay = policy.delay_for_attempt(1);
            debug!(listener_id = %job.listener_id, ?delay, "listener busy, rescheduling");
            self.queue.enqueue(job.reschedule_after(delay))?;
            return Ok(JobDisposition::Retried);
        }

        if policy.should_retry(job.attempt) {
            let delay = policy.delay_for_attempt(job.attempt + 1);
            warn!(
                listener_id = %job.listener_id,
                attempt = job.attempt + 1,
                ?delay,
                error = %err,
                "catch-up job failed, retrying"
            );
            self.queue.enqueue(job.retry_after(delay))?;
            return Ok(JobDisposition::Retried);
        }

        error!(
            listener_id = %job.listener_id,
            attempts = job.attempt + 1,
            error = %err,
            "catch-up job exhausted its retries"
        );
        self.queue.dead_letter(job, err.to_string())?;
        Ok(JobDisposition::DeadLettered)
    }
}

impl core::fmt::Debug for CatchUpWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CatchUpWorker")
            .field("stores", &self.managers.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
