//! Job value object: payload, retry policy, and lifecycle timestamps.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::state::JobState;

/// Upper bound on the retry backoff.
pub const MAX_BACKOFF_SECS: u64 = 300;

/// Default number of attempts before a job is marked failed.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// `from + secs`, or `None` when the result is not a representable time.
pub fn seconds_after(from: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(secs).ok()?;
    from.checked_add_signed(chrono::TimeDelta::try_seconds(secs)?)
}

/// Failure details captured when a job attempt fails.
///
/// Stored alongside the job so the failure survives persistence and can be
/// inspected through the failed-jobs queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobException {
    /// One-line error message.
    pub message: String,
    /// Full error report including the cause chain.
    pub trace: String,
}

impl JobException {
    /// Capture an error and its cause chain.
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            trace: format!("{err:?}"),
        }
    }

    /// Exception with no further context.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            trace: message.clone(),
            message,
        }
    }
}

impl std::fmt::Display for JobException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// A unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID.
    pub id: String,
    /// Selects the handler that executes this job.
    pub job_type: String,
    /// Arbitrary JSON object handed to the handler.
    pub payload: serde_json::Value,
    /// Current lifecycle state.
    pub state: JobState,
    /// Higher values are claimed first.
    pub priority: i32,
    /// Name of the queue this job belongs to.
    pub queue: String,
    /// Attempts started so far.
    pub attempts: u32,
    /// Attempts allowed before the job is marked failed.
    pub max_attempts: u32,
    /// Execution deadline in seconds (0 = unbounded).
    pub timeout: u64,
    /// Seconds before the job becomes eligible.
    pub delay: u64,
    /// Earliest instant a worker may claim the job.
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Last failure, if any.
    pub exception: Option<JobException>,
    /// Job IDs this job relates to. Informational only.
    pub dependencies: Vec<String>,
    pub tags: Vec<String>,
}

impl Job {
    pub const PRIORITY_LOW: i32 = 1;
    pub const PRIORITY_NORMAL: i32 = 5;
    pub const PRIORITY_HIGH: i32 = 10;
    pub const PRIORITY_URGENT: i32 = 15;

    /// Create a pending job with normal priority and default retry policy.
    pub fn new(
        job_type: impl Into<String>,
        queue: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            state: JobState::Pending,
            priority: Self::PRIORITY_NORMAL,
            queue: queue.into(),
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            timeout: 0,
            delay: 0,
            available_at: now,
            created_at: now,
            updated_at: now,
            failed_at: None,
            completed_at: None,
            exception: None,
            dependencies: Vec::new(),
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the job back for `seconds` after creation.
    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = seconds;
        // Out-of-range delays are rejected by `validate`.
        self.available_at =
            seconds_after(self.created_at, seconds).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Reject jobs that must never reach storage.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.trim().is_empty() {
            return Err(JobError::Validation("job id is empty".into()));
        }
        if self.queue.trim().is_empty() {
            return Err(JobError::Validation("queue name is empty".into()));
        }
        if self.job_type.trim().is_empty() {
            return Err(JobError::Validation("job type is empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(JobError::Validation("max_attempts must be at least 1".into()));
        }
        if seconds_after(self.created_at, self.delay).is_none() {
            return Err(JobError::Validation(format!("delay of {}s is out of range", self.delay)));
        }
        if i64::try_from(self.timeout).is_err() {
            return Err(JobError::Validation(format!("timeout of {}s is out of range", self.timeout)));
        }
        if !self.payload.is_object() {
            return Err(JobError::Validation("payload must be a JSON object".into()));
        }
        Ok(())
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set the state unconditionally, stamping the matching timestamps.
    pub fn set_state(&mut self, state: JobState) {
        let now = Utc::now();
        self.state = state;
        self.updated_at = now;
        match state {
            JobState::Completed => self.completed_at = Some(now),
            JobState::Failed => self.failed_at = Some(now),
            _ => {}
        }
    }

    /// Move to `target` if the state machine allows it.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                state: self.state.to_string(),
                target: target.to_string(),
            });
        }
        self.set_state(target);
        Ok(())
    }

    /// Start a new attempt: the job is processing and `attempts` counts it.
    pub fn begin_attempt(&mut self) -> Result<(), JobError> {
        if self.state != JobState::Processing {
            self.transition_to(JobState::Processing)?;
        }
        self.attempts += 1;
        self.touch();
        Ok(())
    }

    /// Whether another attempt is allowed.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether the creation delay has elapsed (`created_at + delay < now`).
    pub fn is_expired(&self) -> bool {
        seconds_after(self.created_at, self.delay).is_some_and(|at| at < Utc::now())
    }

    /// Whether a worker may claim the job at `now`.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.available_at <= now
    }

    /// Backoff before the next attempt: `min(2^attempts, 300)` seconds.
    pub fn retry_backoff(&self) -> Duration {
        let secs = 2u64
            .checked_pow(self.attempts)
            .unwrap_or(MAX_BACKOFF_SECS)
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }

    /// Record a failed attempt.
    pub fn record_failure(&mut self, exception: JobException) {
        self.exception = Some(exception);
        self.touch();
    }

    /// Capture `err` (message plus cause chain) as the latest failure.
    pub fn fail(&mut self, err: &anyhow::Error) {
        self.record_failure(JobException::from_error(err));
    }

    /// Reset a failed job so it can run again from scratch.
    pub fn reset_for_retry(&mut self) -> Result<(), JobError> {
        self.transition_to(JobState::Pending)?;
        self.attempts = 0;
        self.exception = None;
        self.failed_at = None;
        self.delay = 0;
        self.available_at = self.updated_at;
        Ok(())
    }

    /// Execution deadline, if any.
    pub fn deadline(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new("email", "default", serde_json::json!({ "to": "a@example.com" }))
    }

    #[test]
    fn new_job_defaults() {
        let job = job();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.priority, Job::PRIORITY_NORMAL);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert_eq!(job.available_at, job.created_at);
        assert!(job.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_queue() {
        let job = Job::new("email", "  ", serde_json::json!({}));
        assert!(matches!(job.validate(), Err(JobError::Validation(_))));
    }

    #[test]
    fn validation_rejects_non_object_payload() {
        let job = Job::new("email", "default", serde_json::json!([1, 2]));
        assert!(job.validate().is_err());
    }

    #[test]
    fn validation_rejects_zero_attempts() {
        let job = job().with_max_attempts(0);
        assert!(job.validate().is_err());
    }

    #[test]
    fn delay_moves_availability() {
        let job = job().with_delay(60);
        assert_eq!(job.available_at - job.created_at, chrono::Duration::seconds(60));
        assert!(!job.is_available(Utc::now()));
        assert!(!job.is_expired());
    }

    #[test]
    fn out_of_range_delay_is_rejected_not_panicking() {
        let job = job().with_delay(10_000_000_000_000);
        assert_eq!(job.available_at, DateTime::<Utc>::MAX_UTC);
        assert!(!job.is_expired());
        assert!(matches!(job.validate(), Err(JobError::Validation(_))));

        let job = self::job().with_delay(u64::MAX);
        assert!(matches!(job.validate(), Err(JobError::Validation(_))));
    }

    #[test]
    fn out_of_range_timeout_is_rejected() {
        let job = job().with_timeout(u64::MAX);
        assert!(matches!(job.validate(), Err(JobError::Validation(_))));
    }

    #[test]
    fn begin_attempt_counts() {
        let mut job = job();
        job.begin_attempt().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.can_retry());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut job = job();
        job.attempts = 1;
        assert_eq!(job.retry_backoff(), Duration::from_secs(2));
        job.attempts = 2;
        assert_eq!(job.retry_backoff(), Duration::from_secs(4));
        job.attempts = 8;
        assert_eq!(job.retry_backoff(), Duration::from_secs(256));
        job.attempts = 9;
        assert_eq!(job.retry_backoff(), Duration::from_secs(300));
        job.attempts = 80;
        assert_eq!(job.retry_backoff(), Duration::from_secs(300));
    }

    #[test]
    fn terminal_transitions_stamp_timestamps() {
        let mut job = job();
        job.begin_attempt().unwrap();
        job.transition_to(JobState::Completed).unwrap();
        assert!(job.completed_at.is_some());

        let mut job = self::job();
        job.begin_attempt().unwrap();
        job.transition_to(JobState::Failed).unwrap();
        assert!(job.failed_at.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut job = job();
        let err = job.transition_to(JobState::Completed).unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition { .. }));
    }

    #[test]
    fn exception_keeps_cause_chain() {
        let err = anyhow::anyhow!("connection refused").context("sending email");
        let exc = JobException::from_error(&err);
        assert_eq!(exc.message, "sending email");
        assert!(exc.trace.contains("connection refused"));
    }

    #[test]
    fn reset_for_retry_clears_failure() {
        let mut job = job();
        job.begin_attempt().unwrap();
        job.fail(&anyhow::anyhow!("boom"));
        assert_eq!(job.exception.as_ref().unwrap().message, "boom");
        job.transition_to(JobState::Failed).unwrap();

        job.reset_for_retry().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.exception.is_none());
        assert!(job.failed_at.is_none());
    }
}
