//! Queue manager: one entry point over the store, workers and scheduler.

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::job::{Job, JobState};
use crate::scheduler::{JobScheduler, ScheduledJob, UpcomingRun, spawn_scheduler};
use crate::store::{JobStore, LibSqlJobStore, PayloadCodec, QuarantinedJob, QueueStats};
use crate::worker::{HandlerRegistry, Worker, WorkerExit, WorkerHandle, WorkerOptions};

/// A worker slot: the control handle plus the task that supervises it.
struct WorkerSlot {
    handle: WorkerHandle,
    task: JoinHandle<WorkerExit>,
}

/// Facade composing the job store, handler registry, workers and scheduler.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    scheduler: Arc<JobScheduler>,
    workers: Mutex<Vec<WorkerSlot>>,
    /// Number of worker slots still running.
    live_workers: Arc<watch::Sender<usize>>,
    shutdown_tx: watch::Sender<bool>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn JobStore>, handlers: Arc<HandlerRegistry>) -> Self {
        let scheduler = Arc::new(JobScheduler::new(Arc::clone(&store)));
        Self::with_scheduler(store, handlers, scheduler)
    }

    pub fn with_scheduler(
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        scheduler: Arc<JobScheduler>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (live_workers, _) = watch::channel(0usize);
        Self {
            store,
            handlers,
            scheduler,
            workers: Mutex::new(Vec::new()),
            live_workers: Arc::new(live_workers),
            shutdown_tx,
            scheduler_task: Mutex::new(None),
        }
    }

    /// Open the configured database and build a manager with the built-in handlers.
    pub async fn open(config: &QueueConfig) -> Result<Self> {
        let codec = PayloadCodec::new(&config.encryption_key, config.compression_threshold)?;
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlJobStore::new_local(&config.db_path, codec).await?);
        let handlers = Arc::new(HandlerRegistry::with_builtins());
        let scheduler = Arc::new(
            JobScheduler::new(Arc::clone(&store)).with_check_interval(config.check_interval),
        );
        Ok(Self::with_scheduler(store, handlers, scheduler))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    // ── Queue operations ────────────────────────────────────────────

    /// Validate and enqueue a job. Returns its id.
    pub async fn push(&self, job: Job) -> Result<String> {
        job.validate()?;
        self.store.push(&job).await?;
        Ok(job.id)
    }

    /// Claim the next eligible job from `queue`.
    pub async fn pop(&self, queue: &str) -> Result<Option<Job>> {
        Ok(self.store.pop(queue).await?)
    }

    pub async fn get_queue_stats(&self, queue: Option<&str>) -> Result<Vec<QueueStats>> {
        Ok(self.store.get_stats(queue).await?)
    }

    pub async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>> {
        Ok(self.store.get_failed_jobs(queue).await?)
    }

    /// Put a failed job back in its queue with a fresh attempt budget.
    ///
    /// Returns false if the job does not exist or has not failed.
    pub async fn retry_failed_job(&self, id: &str) -> Result<bool> {
        let Some(mut job) = self.store.get_job_by_id(id).await? else {
            return Ok(false);
        };
        if job.state != JobState::Failed {
            return Ok(false);
        }
        job.reset_for_retry()?;
        self.store.update(&job).await?;
        info!(job_id = %id, queue = %job.queue, "Failed job requeued");
        Ok(true)
    }

    /// Cancel a pending or retrying job. Returns false in any other state.
    pub async fn cancel_job(&self, id: &str) -> Result<bool> {
        Ok(self.store.cancel(id).await?)
    }

    pub async fn purge_queue(&self, queue: &str) -> Result<u64> {
        Ok(self.store.purge(queue).await?)
    }

    pub async fn get_job_by_id(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store.get_job_by_id(id).await?)
    }

    pub async fn get_jobs_by_state(
        &self,
        state: JobState,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        Ok(self.store.get_jobs_by_state(state, queue, limit).await?)
    }

    pub async fn list_quarantined(&self) -> Result<Vec<QuarantinedJob>> {
        Ok(self.store.list_quarantined().await?)
    }

    // ── Scheduling ──────────────────────────────────────────────────

    pub async fn schedule_job(&self, scheduled: ScheduledJob) -> Result<String> {
        self.scheduler.schedule(scheduled).await
    }

    /// Schedule `job` from a phrase such as "weekdays at 9am" or raw cron text.
    pub async fn schedule_natural(&self, job: Job, phrase: &str, recurring: bool) -> Result<String> {
        let cron = self.scheduler.parser().parse(phrase)?;
        let scheduled = ScheduledJob::new(job, cron)?;
        let scheduled = if recurring { scheduled } else { scheduled.once() };
        self.scheduler.schedule(scheduled).await
    }

    pub async fn unschedule_job(&self, id: &str) -> bool {
        self.scheduler.unschedule(id).await
    }

    pub async fn get_scheduled_jobs(&self) -> Vec<ScheduledJob> {
        self.scheduler.scheduled_jobs().await
    }

    pub async fn get_next_run_times(&self, limit: usize) -> Vec<UpcomingRun> {
        self.scheduler.next_run_times(limit).await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start `count` workers on `queue`. Workers that exit for recycling are
    /// replaced under the same handle until stopped or killed.
    pub async fn spawn_workers(
        &self,
        queue: &str,
        count: usize,
        options: WorkerOptions,
    ) -> Vec<WorkerHandle> {
        let mut slots = self.workers.lock().await;
        let mut handles = Vec::with_capacity(count);

        for _ in 0..count {
            let handle = WorkerHandle::new(format!("{queue}-worker-{}", slots.len() + 1));
            self.live_workers.send_modify(|n| *n += 1);
            let task = tokio::spawn(supervise(
                queue.to_string(),
                Arc::clone(&self.store),
                Arc::clone(&self.handlers),
                options.clone(),
                handle.clone(),
                Arc::clone(&self.live_workers),
            ));
            handles.push(handle.clone());
            slots.push(WorkerSlot { handle, task });
        }

        info!(queue = %queue, count, "Workers spawned");
        handles
    }

    /// Handles of all spawned workers.
    pub async fn worker_handles(&self) -> Vec<WorkerHandle> {
        self.workers
            .lock()
            .await
            .iter()
            .map(|s| s.handle.clone())
            .collect()
    }

    /// Resolves once no worker slot is running.
    pub async fn wait_for_workers(&self) {
        let mut rx = self.live_workers.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Start the scheduler loop. Returns false if it is already running.
    pub async fn spawn_scheduler(&self) -> bool {
        let mut task = self.scheduler_task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }
        self.shutdown_tx.send_replace(false);
        *task = Some(spawn_scheduler(
            Arc::clone(&self.scheduler),
            self.shutdown_tx.subscribe(),
        ));
        true
    }

    /// Stop the scheduler and all workers, waiting for running jobs to finish.
    pub async fn shutdown(&self) -> Vec<WorkerExit> {
        info!("Shutting down queue manager");
        self.shutdown_tx.send_replace(true);

        let slots = std::mem::take(&mut *self.workers.lock().await);
        for slot in &slots {
            slot.handle.stop();
        }

        let mut exits = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot.task.await {
                Ok(exit) => exits.push(exit),
                Err(e) => warn!(worker = %slot.handle.name(), error = %e, "Worker task failed"),
            }
        }

        if let Some(task) = self.scheduler_task.lock().await.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "Scheduler task failed");
        }

        info!(workers = exits.len(), "Queue manager stopped");
        exits
    }
}

/// Run workers in one slot, replacing them while they exit for recycling.
async fn supervise(
    queue: String,
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    options: WorkerOptions,
    handle: WorkerHandle,
    live: Arc<watch::Sender<usize>>,
) -> WorkerExit {
    let mut generation = 1u32;
    let exit = loop {
        let worker = Worker::with_handle(
            queue.clone(),
            Arc::clone(&store),
            Arc::clone(&handlers),
            options.clone(),
            handle.clone(),
        );
        let exit = worker.run().await;
        if !exit.wants_restart() {
            break exit;
        }
        generation += 1;
        info!(worker = %handle.name(), reason = ?exit, generation, "Recycling worker");
    };

    if exit == WorkerExit::MemoryLimit {
        warn!(worker = %handle.name(), "Worker slot ended on memory limit; restart the process to reclaim memory");
    }
    live.send_modify(|n| *n = n.saturating_sub(1));
    exit
}
