//! A job template bound to a cron schedule.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScheduleError;
use crate::job::Job;
use crate::scheduler::cron::{CronExpression, truncate_to_minute};

/// Scheduled job: a template dispatched as a fresh job on every due run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    /// Template for dispatched jobs. Never persisted itself.
    pub job: Job,
    pub cron: CronExpression,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub recurring: bool,
    /// After this instant the schedule is dropped.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    /// Recurring schedule for `job`, with `next_run_at` computed from now.
    pub fn new(job: Job, cron: CronExpression) -> Result<Self, ScheduleError> {
        let next = cron.next_run_date(Utc::now())?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            job,
            cron,
            next_run_at: Some(next),
            last_run_at: None,
            recurring: true,
            expires_at: None,
        })
    }

    /// Run once at the next due time, then drop.
    pub fn once(mut self) -> Self {
        self.recurring = false;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Due when not expired and the next run time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && self.next_run_at.is_some_and(|next| next <= now)
    }

    /// Record a run at `now` and advance the schedule.
    ///
    /// Recurring jobs move to the first due minute after the current one;
    /// one-shot or expired jobs get no next run.
    pub fn mark_as_run(&mut self, now: DateTime<Utc>) -> Result<(), ScheduleError> {
        self.last_run_at = Some(now);
        self.next_run_at = None;

        if self.recurring {
            let next = self
                .cron
                .next_run_date(truncate_to_minute(now) + Duration::minutes(1))?;
            if !self.is_expired(next) {
                self.next_run_at = Some(next);
            }
        }
        Ok(())
    }

    /// Whether the scheduler should keep this entry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_some() && !self.is_expired(now)
    }

    /// Build the job to enqueue for one run.
    pub fn instantiate(&self) -> Job {
        let template = &self.job;
        Job::new(
            template.job_type.clone(),
            template.queue.clone(),
            template.payload.clone(),
        )
        .with_priority(template.priority)
        .with_max_attempts(template.max_attempts)
        .with_timeout(template.timeout)
        .with_tags(template.tags.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn template() -> Job {
        Job::new("report", "reports", serde_json::json!({ "kind": "daily" }))
            .with_priority(Job::PRIORITY_HIGH)
            .with_tags(["nightly"])
            .with_timeout(120)
            .with_delay(30)
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    fn scheduled(expr: &str, next: DateTime<Utc>) -> ScheduledJob {
        let mut s = ScheduledJob::new(template(), CronExpression::parse(expr).unwrap()).unwrap();
        s.next_run_at = Some(next);
        s
    }

    #[test]
    fn due_once_next_run_arrives() {
        let s = scheduled("*/15 * * * *", at(10, 15));
        assert!(!s.is_due(at(10, 14)));
        assert!(s.is_due(at(10, 15)));
        assert!(s.is_due(at(10, 16)));
    }

    #[test]
    fn recurring_advances_past_current_minute() {
        let mut s = scheduled("*/15 * * * *", at(10, 15));
        s.mark_as_run(at(10, 15) + Duration::seconds(20)).unwrap();
        assert_eq!(s.next_run_at, Some(at(10, 30)));
        assert!(s.last_run_at.is_some());
        assert!(!s.is_due(at(10, 15) + Duration::seconds(50)));
    }

    #[test]
    fn one_shot_has_no_next_run() {
        let mut s = scheduled("0 * * * *", at(10, 0)).once();
        s.mark_as_run(at(10, 0)).unwrap();
        assert_eq!(s.next_run_at, None);
        assert!(!s.is_active(at(10, 1)));
    }

    #[test]
    fn expiry_blocks_dispatch_and_next_run() {
        let mut s = scheduled("*/15 * * * *", at(10, 15)).expires_at(at(10, 20));
        assert!(s.is_due(at(10, 16)));
        s.mark_as_run(at(10, 16)).unwrap();
        assert_eq!(s.next_run_at, None);
        assert!(!s.is_due(at(10, 30)));
    }

    #[test]
    fn instantiate_copies_template_with_fresh_id() {
        let s = scheduled("0 * * * *", at(10, 0));
        let job = s.instantiate();
        assert_ne!(job.id, s.job.id);
        assert_eq!(job.payload, s.job.payload);
        assert_eq!(job.queue, "reports");
        assert_eq!(job.priority, Job::PRIORITY_HIGH);
        assert_eq!(job.tags, vec!["nightly".to_string()]);
        assert_eq!(job.timeout, 120);
        assert_eq!(job.delay, 0);
        assert_eq!(job.available_at, job.created_at);
    }

    #[test]
    fn serializes_cron_as_text() {
        let s = scheduled("0 9 * * 1-5", at(9, 0));
        let value = serde_json::to_value(&s).unwrap();
        assert_eq!(value["cron"], "0 9 * * 1-5");
        let back: ScheduledJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, s);
    }
}
