//! Scheduler: owns the schedule registry and dispatches due jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::job::Job;
use crate::scheduler::natural::NaturalLanguageParser;
use crate::scheduler::scheduled::ScheduledJob;
use crate::store::JobStore;

/// Default interval between dispatch checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// One entry of [`JobScheduler::next_run_times`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpcomingRun {
    pub schedule_id: String,
    pub job_type: String,
    pub queue: String,
    pub cron: String,
    pub run_at: DateTime<Utc>,
}

/// Registry of scheduled jobs plus the dispatch loop that enqueues them.
pub struct JobScheduler {
    store: Arc<dyn JobStore>,
    jobs: RwLock<HashMap<String, ScheduledJob>>,
    parser: NaturalLanguageParser,
    check_interval: Duration,
    /// Serializes ticks so a schedule is never dispatched twice for one run.
    dispatch_lock: Mutex<()>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            jobs: RwLock::new(HashMap::new()),
            parser: NaturalLanguageParser::new(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            dispatch_lock: Mutex::new(()),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_parser(mut self, parser: NaturalLanguageParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn parser(&self) -> &NaturalLanguageParser {
        &self.parser
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Register a schedule. Computes `next_run_at` if it has never run.
    pub async fn schedule(&self, mut scheduled: ScheduledJob) -> Result<String, Error> {
        scheduled.job.validate()?;
        if scheduled.next_run_at.is_none() && scheduled.last_run_at.is_none() {
            scheduled.next_run_at = Some(scheduled.cron.next_run_date(Utc::now())?);
        }

        let id = scheduled.id.clone();
        info!(
            schedule_id = %id,
            cron = %scheduled.cron,
            job_type = %scheduled.job.job_type,
            queue = %scheduled.job.queue,
            next_run_at = ?scheduled.next_run_at,
            "Job scheduled"
        );
        self.jobs.write().await.insert(id.clone(), scheduled);
        Ok(id)
    }

    /// Remove a schedule. Returns whether it existed.
    pub async fn unschedule(&self, id: &str) -> bool {
        let removed = self.jobs.write().await.remove(id).is_some();
        if removed {
            info!(schedule_id = %id, "Job unscheduled");
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.read().await.get(id).cloned()
    }

    /// All schedules, soonest first.
    pub async fn scheduled_jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// The next `limit` upcoming runs across all schedules, soonest first.
    pub async fn next_run_times(&self, limit: usize) -> Vec<UpcomingRun> {
        let mut runs: Vec<UpcomingRun> = self
            .jobs
            .read()
            .await
            .values()
            .filter_map(|s| {
                s.next_run_at.map(|run_at| UpcomingRun {
                    schedule_id: s.id.clone(),
                    job_type: s.job.job_type.clone(),
                    queue: s.job.queue.clone(),
                    cron: s.cron.to_string(),
                    run_at,
                })
            })
            .collect();
        runs.sort_by(|a, b| a.run_at.cmp(&b.run_at).then(a.schedule_id.cmp(&b.schedule_id)));
        runs.truncate(limit);
        runs
    }

    /// Dispatch every schedule due at `now`. Returns the number of jobs enqueued.
    ///
    /// A failed push leaves that schedule untouched so the next tick retries it.
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let _dispatching = self.dispatch_lock.lock().await;

        // Registry lock is released before any store call.
        let due: Vec<(String, Job)> = {
            let mut jobs = self.jobs.write().await;
            jobs.retain(|id, s| {
                let expired = s.is_expired(now);
                if expired {
                    debug!(schedule_id = %id, "Dropping expired schedule");
                }
                !expired
            });

            let mut due: Vec<&ScheduledJob> = jobs.values().filter(|s| s.is_due(now)).collect();
            due.sort_by(|a, b| b.job.priority.cmp(&a.job.priority));
            due.into_iter().map(|s| (s.id.clone(), s.instantiate())).collect()
        };

        let mut dispatched = Vec::with_capacity(due.len());
        for (schedule_id, job) in due {
            if let Err(e) = self.store.push(&job).await {
                error!(schedule_id = %schedule_id, error = %e, "Failed to dispatch scheduled job");
                continue;
            }
            debug!(schedule_id = %schedule_id, job_id = %job.id, queue = %job.queue, "Dispatched scheduled job");
            dispatched.push(schedule_id);
        }

        let mut jobs = self.jobs.write().await;
        for schedule_id in &dispatched {
            // Unscheduled while its push was in flight.
            let Some(scheduled) = jobs.get_mut(schedule_id) else {
                continue;
            };
            if let Err(e) = scheduled.mark_as_run(now) {
                warn!(schedule_id = %schedule_id, error = %e, "Schedule has no further runs");
            }
        }

        jobs.retain(|_, s| s.is_active(now));
        if !dispatched.is_empty() {
            info!(dispatched = dispatched.len(), remaining = jobs.len(), "Scheduler tick");
        }
        dispatched.len()
    }

    /// Tick every `check_interval` until `shutdown` becomes true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = self.check_interval();
        info!(interval_secs = interval.as_secs_f64(), "Scheduler starting");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Scheduler stopped");
    }
}

/// Spawn the scheduler loop on the runtime.
pub fn spawn_scheduler(
    scheduler: Arc<JobScheduler>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown))
}
