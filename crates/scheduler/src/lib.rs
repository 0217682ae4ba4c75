//! Priority-ordered, bounded-concurrency job queue with attempt-based retry.
//!
//! Jobs wait in a single list ordered by [`Priority`] weight; ties keep
//! arrival order, including jobs re-inserted after a failed attempt. At most
//! `max_concurrent` jobs run at once. A failed attempt is retried after the
//! job's [`Backoff`] delay while other jobs keep flowing.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use pipeconfig::{BackoffKind, QueueSection};
use serde::{Deserialize, Serialize};

mod queue;

pub use queue::{CompileQueue, JobHandle, QueueStats, QueueStatus};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Normal => 2,
            Priority::Low => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(format!(
                "unknown priority '{other}' (expected high, normal or low)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential(Duration),
}

impl Backoff {
    pub fn from_config(kind: BackoffKind, delay: Duration) -> Self {
        match kind {
            BackoffKind::Fixed => Backoff::Fixed(delay),
            BackoffKind::Exponential => Backoff::Exponential(delay),
        }
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(base) => base,
            Backoff::Exponential(base) => {
                // Saturates once the multiplier or the product overflows.
                2u32.checked_pow(attempt.saturating_sub(1))
                    .and_then(|factor| base.checked_mul(factor))
                    .unwrap_or(Duration::MAX)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobOptions {
    pub priority: Priority,
    /// Total attempts including the first one.
    pub attempts: u32,
    pub backoff: Backoff,
}

impl JobOptions {
    pub fn from_section(section: &QueueSection) -> Self {
        Self {
            priority: Priority::Normal,
            attempts: section.attempts,
            backoff: Backoff::from_config(section.backoff, section.backoff_delay),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from_section(&QueueSection::default())
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable: std::error::Error {
    fn is_retryable(&self) -> bool {
        true
    }
}

/// Executes one attempt of a job. Implementations must not panic; a panic
/// abandons the job and its handle resolves to [`JobError::Abandoned`].
pub trait JobRunner<J>: Send + Sync + 'static {
    type Output: Send + 'static;
    type Error: Retryable + Send + 'static;

    fn run(
        &self,
        id: JobId,
        job: &J,
        attempt: u32,
    ) -> impl Future<Output = Result<Self::Output, Self::Error>> + Send;
}

/// Lifecycle transitions reported to a [`JobObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Queued {
        id: JobId,
        priority: Priority,
    },
    Started {
        id: JobId,
        attempt: u32,
        waited: Duration,
    },
    RetryScheduled {
        id: JobId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    Completed {
        id: JobId,
        attempts: u32,
    },
    Failed {
        id: JobId,
        attempts: u32,
        error: String,
    },
}

impl JobEvent {
    pub fn id(&self) -> JobId {
        match self {
            JobEvent::Queued { id, .. }
            | JobEvent::Started { id, .. }
            | JobEvent::RetryScheduled { id, .. }
            | JobEvent::Completed { id, .. }
            | JobEvent::Failed { id, .. } => *id,
        }
    }
}

/// Passive sink for queue transitions. Called outside the queue lock.
pub trait JobObserver<J>: Send + Sync + 'static {
    fn on_event(&self, job: &J, event: &JobEvent);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("compile queue is closed")]
    Closed,
    #[error("a job needs at least one attempt")]
    NoAttempts,
}

/// Terminal failure: the last error after attempts ran out or a
/// non-retryable error.
#[derive(Debug)]
pub struct JobFailure<E> {
    pub job: JobId,
    pub attempts: u32,
    pub error: E,
}

impl<E: fmt::Display> fmt::Display for JobFailure<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} failed after {} attempt(s): {}",
            self.job, self.attempts, self.error
        )
    }
}

impl<E: std::error::Error + 'static> std::error::Error for JobFailure<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Outcome error delivered through a [`JobHandle`].
#[derive(Debug)]
pub enum JobError<E> {
    Failed(JobFailure<E>),
    Abandoned(JobId),
}

impl<E> JobError<E> {
    pub fn failure(&self) -> Option<&JobFailure<E>> {
        match self {
            JobError::Failed(failure) => Some(failure),
            JobError::Abandoned(_) => None,
        }
    }
}

impl<E: fmt::Display> fmt::Display for JobError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Failed(failure) => failure.fmt(f),
            JobError::Abandoned(id) => write!(f, "job {id} was abandoned before finishing"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for JobError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            JobError::Failed(failure) => Some(&failure.error),
            JobError::Abandoned(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::Exponential(Duration::from_millis(500));
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(32), Duration::from_millis(500) * (1 << 31));
        assert_eq!(backoff.delay(33), Duration::MAX);
        assert_eq!(backoff.delay(64), Duration::MAX);
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_secs(2));
        assert_eq!(backoff.delay(1), backoff.delay(5));
    }

    #[test]
    fn options_follow_queue_section() {
        let section = QueueSection {
            max_concurrent: 1,
            attempts: 5,
            backoff: BackoffKind::Fixed,
            backoff_delay: Duration::from_millis(250),
        };
        let options = JobOptions::from_section(&section).with_priority(Priority::High);
        assert_eq!(options.attempts, 5);
        assert_eq!(options.priority, Priority::High);
        assert_eq!(options.backoff, Backoff::Fixed(Duration::from_millis(250)));
    }

    #[test]
    fn priority_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<Priority>(), Ok(Priority::High));
        assert_eq!(" low ".parse::<Priority>(), Ok(Priority::Low));
        assert!("urgent".parse::<Priority>().is_err());
        assert!(Priority::High.weight() > Priority::Normal.weight());
        assert!(Priority::Normal.weight() > Priority::Low.weight());
    }
}
