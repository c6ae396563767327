//! Catch-up job types and retry policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::JobId;

/// Request to bring one listener of one event store up to date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpJob {
    pub id: JobId,
    pub listener_id: String,
    pub event_store_id: String,
    /// Number of failed attempts so far (starts at 0).
    pub attempt: u32,
    /// Not to be picked up before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl CatchUpJob {
    pub fn new(listener_id: impl Into<String>, event_store_id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            listener_id: listener_id.into(),
            event_store_id: event_store_id.into(),
            attempt: 0,
            not_before: None,
            enqueued_at: Utc::now(),
        }
    }

    /// Same job, one attempt later, scheduled `delay` from now.
    pub fn retry_after(mut self, delay: Duration) -> Self {
        self.attempt += 1;
        self.reschedule_after(delay)
    }

    /// Same job and attempt, scheduled `delay` from now.
    pub fn reschedule_after(mut self, delay: Duration) -> Self {
        self.not_before = Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.not_before {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Pending jobs with the same key are interchangeable.
    pub fn key(&self) -> (&str, &str) {
        (&self.event_store_id, &self.listener_id)
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^(attempt - 1)
    #[default]
    Exponential,
    /// Linear backoff: base * attempt
    Linear,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn linear(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic jitter derived from the attempt number.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }

    /// Whether a job that already failed `attempt` times may run again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A job that exhausted its retries or can never succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: CatchUpJob,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}
