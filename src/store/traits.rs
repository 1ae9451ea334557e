//! `JobStore` trait: the persistent priority queue contract shared by
//! workers, the scheduler and the manager facade.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::job::{Job, JobState};

/// Per-queue aggregate returned by [`JobStore::get_stats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub total_jobs: u64,
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub retrying: u64,
    pub cancelled: u64,
    pub average_priority: f64,
    pub oldest_created_at: Option<DateTime<Utc>>,
    pub newest_created_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    /// Count for a single state.
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Retrying => self.retrying,
            JobState::Cancelled => self.cancelled,
        }
    }
}

/// A stored row whose payload could not be decoded, moved out of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedJob {
    pub id: String,
    pub queue: String,
    pub job_type: String,
    /// The stored payload text, untouched.
    pub payload: String,
    pub reason: String,
    pub quarantined_at: DateTime<Utc>,
}

/// Backend-agnostic persistent job queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job. The payload is encrypted (and compressed when large).
    async fn push(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Atomically claim the best eligible pending job in `queue`.
    ///
    /// Highest priority first, then oldest. The returned job is already in
    /// the `processing` state; no other caller can receive the same job
    /// until it is released or deleted.
    async fn pop(&self, queue: &str) -> Result<Option<Job>, DatabaseError>;

    /// Same selection as [`JobStore::pop`], without claiming.
    async fn peek(&self, queue: &str) -> Result<Option<Job>, DatabaseError>;

    /// Delete a job. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Persist state, attempts, timestamps and exception of an existing job.
    async fn update(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Put a job back to `pending`, eligible again after `delay`.
    async fn release(&self, job: &mut Job, delay: Duration) -> Result<(), DatabaseError>;

    /// Cancel a job that is still waiting (pending or retrying).
    /// Returns false if it does not exist or is in any other state.
    async fn cancel(&self, id: &str) -> Result<bool, DatabaseError>;

    /// Delete every job in `queue`. Returns the number removed.
    async fn purge(&self, queue: &str) -> Result<u64, DatabaseError>;

    /// Failed jobs, most recently updated first.
    async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>, DatabaseError>;

    /// Jobs in `state`, most recently updated first.
    async fn get_jobs_by_state(
        &self,
        state: JobState,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError>;

    /// Look up a job by ID.
    async fn get_job_by_id(&self, id: &str) -> Result<Option<Job>, DatabaseError>;

    /// Aggregates per queue (a single entry when `queue` is given).
    async fn get_stats(&self, queue: Option<&str>) -> Result<Vec<QueueStats>, DatabaseError>;

    /// Delete completed jobs that finished more than `hours_old` hours ago.
    async fn cleanup_old_completed_jobs(&self, hours_old: u64) -> Result<u64, DatabaseError>;

    /// Rows moved aside because their payload could not be decoded.
    async fn list_quarantined(&self) -> Result<Vec<QuarantinedJob>, DatabaseError>;
}
