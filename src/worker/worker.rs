//! Queue worker: claims jobs from one queue and executes them.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{DatabaseError, JobError};
use crate::job::{Job, JobException, JobState};
use crate::store::JobStore;
use crate::worker::control::{WorkerHandle, WorkerSignal};
use crate::worker::handler::{HandlerRegistry, JobContext};
use crate::worker::resources;

/// Tunables for a worker. Zero means unbounded for the limits.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Total run time before the worker exits for recycling.
    pub run_timeout: Duration,
    pub memory_limit_mb: u64,
    /// Jobs processed before the worker exits for recycling.
    pub max_jobs: u64,
    /// Wait between empty polls.
    pub idle_wait: Duration,
    /// Wait after a storage error.
    pub error_backoff: Duration,
    pub heartbeat_interval: Duration,
    pub gc_interval: Duration,
    /// Completed jobs older than this are deleted by the periodic GC.
    pub retention_hours: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            run_timeout: Duration::ZERO,
            memory_limit_mb: 0,
            max_jobs: 0,
            idle_wait: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            gc_interval: Duration::from_secs(300),
            retention_hours: 1,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    Killed,
    /// `run_timeout` elapsed.
    TimedOut,
    /// Resident memory exceeded `memory_limit_mb`.
    MemoryLimit,
    /// `max_jobs` processed.
    MaxJobs,
}

impl WorkerExit {
    /// Whether an in-process replacement worker should be started.
    ///
    /// Memory pressure is process-wide, so `MemoryLimit` ends the slot and
    /// leaves the restart to whatever supervises the process.
    pub fn wants_restart(&self) -> bool {
        matches!(self, Self::TimedOut | Self::MaxJobs)
    }
}

/// Result of one handler invocation.
enum Outcome {
    Success,
    Failure(anyhow::Error),
    Killed,
}

/// Worker bound to a single queue.
pub struct Worker {
    name: String,
    queue: String,
    store: Arc<dyn JobStore>,
    handlers: Arc<HandlerRegistry>,
    options: WorkerOptions,
    handle: WorkerHandle,
    control: watch::Receiver<WorkerSignal>,
    processed: u64,
    failed: u64,
    started: Instant,
    last_heartbeat: Instant,
    last_gc: Instant,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        options: WorkerOptions,
    ) -> Self {
        Self::with_handle(queue, store, handlers, options, WorkerHandle::new(name))
    }

    /// Worker controlled by an existing handle, e.g. a replacement for a
    /// recycled worker.
    pub fn with_handle(
        queue: impl Into<String>,
        store: Arc<dyn JobStore>,
        handlers: Arc<HandlerRegistry>,
        options: WorkerOptions,
        handle: WorkerHandle,
    ) -> Self {
        let control = handle.subscribe();
        let now = Instant::now();
        Self {
            name: handle.name().to_string(),
            queue: queue.into(),
            store,
            handlers,
            options,
            handle,
            control,
            processed: 0,
            failed: 0,
            started: now,
            last_heartbeat: now,
            last_gc: now,
        }
    }

    /// Control handle for this worker.
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run until stopped, killed, or a recycling limit is hit.
    pub async fn run(mut self) -> WorkerExit {
        tracing::info!(worker = %self.name, queue = %self.queue, "Worker starting");
        self.started = Instant::now();

        let exit = loop {
            let signal = *self.control.borrow_and_update();
            match signal {
                WorkerSignal::Kill => break WorkerExit::Killed,
                WorkerSignal::Stop => break WorkerExit::Stopped,
                WorkerSignal::Pause => {
                    self.wait(self.options.idle_wait).await;
                    continue;
                }
                WorkerSignal::Run => {}
            }

            if let Some(exit) = self.limit_reached() {
                break exit;
            }
            self.housekeeping().await;

            match self.store.pop(&self.queue).await {
                Ok(Some(job)) => match self.process(job).await {
                    Ok(Some(exit)) => break exit,
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(worker = %self.name, error = %e, "Failed to record job result");
                        self.wait(self.options.error_backoff).await;
                    }
                },
                Ok(None) => self.wait(self.options.idle_wait).await,
                Err(e) => {
                    tracing::error!(worker = %self.name, queue = %self.queue, error = %e, "Failed to poll queue");
                    self.wait(self.options.error_backoff).await;
                }
            }
        };

        tracing::info!(
            worker = %self.name,
            processed = self.processed,
            failed = self.failed,
            reason = ?exit,
            "Worker exiting"
        );
        exit
    }

    /// Sleep for `duration`, returning early if the control signal changes.
    async fn wait(&mut self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.control.changed() => {}
        }
    }

    fn limit_reached(&self) -> Option<WorkerExit> {
        let opts = &self.options;
        if !opts.run_timeout.is_zero() && self.started.elapsed() >= opts.run_timeout {
            return Some(WorkerExit::TimedOut);
        }
        if opts.memory_limit_mb > 0
            && let Some(bytes) = resources::resident_memory_bytes()
            && bytes > opts.memory_limit_mb * 1024 * 1024
        {
            tracing::warn!(
                worker = %self.name,
                rss_mb = bytes / (1024 * 1024),
                limit_mb = opts.memory_limit_mb,
                "Memory limit exceeded"
            );
            return Some(WorkerExit::MemoryLimit);
        }
        if opts.max_jobs > 0 && self.processed >= opts.max_jobs {
            return Some(WorkerExit::MaxJobs);
        }
        None
    }

    /// Periodic heartbeat log and completed-job GC.
    async fn housekeeping(&mut self) {
        if self.last_heartbeat.elapsed() >= self.options.heartbeat_interval {
            self.last_heartbeat = Instant::now();
            tracing::info!(
                worker = %self.name,
                queue = %self.queue,
                processed = self.processed,
                failed = self.failed,
                uptime_secs = self.started.elapsed().as_secs(),
                rss_mb = resources::resident_memory_mb().unwrap_or(0),
                "Worker heartbeat"
            );
        }

        if self.last_gc.elapsed() >= self.options.gc_interval {
            self.last_gc = Instant::now();
            match self
                .store
                .cleanup_old_completed_jobs(self.options.retention_hours)
                .await
            {
                Ok(removed) => {
                    tracing::debug!(worker = %self.name, removed, "Completed-job cleanup finished")
                }
                Err(e) => tracing::warn!(worker = %self.name, error = %e, "Completed-job cleanup failed"),
            }
        }
    }

    /// Execute one claimed job and record the result.
    ///
    /// Returns `Some(WorkerExit::Killed)` when a kill interrupted the job.
    async fn process(&mut self, mut job: Job) -> Result<Option<WorkerExit>, DatabaseError> {
        if let Err(e) = job.begin_attempt() {
            tracing::error!(job_id = %job.id, error = %e, "Claimed job in unexpected state");
            return Ok(None);
        }
        self.store.update(&job).await?;
        self.processed += 1;

        tracing::debug!(
            worker = %self.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Processing job"
        );

        match self.execute(&job).await {
            Outcome::Success => {
                self.set_state(&mut job, JobState::Completed);
                self.store.update(&job).await?;
                tracing::info!(job_id = %job.id, queue = %job.queue, attempts = job.attempts, "Job completed");
            }
            Outcome::Failure(err) => {
                self.failed += 1;
                job.fail(&err);
                if job.can_retry() {
                    self.set_state(&mut job, JobState::Retrying);
                    self.store.update(&job).await?;
                    let backoff = job.retry_backoff();
                    self.store.release(&mut job, backoff).await?;
                    tracing::warn!(
                        job_id = %job.id,
                        attempt = job.attempts,
                        max_attempts = job.max_attempts,
                        backoff_secs = backoff.as_secs(),
                        error = %err,
                        "Job failed, will retry"
                    );
                } else {
                    self.set_state(&mut job, JobState::Failed);
                    self.store.update(&job).await?;
                    tracing::error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = ?err,
                        "Job failed permanently"
                    );
                }
            }
            Outcome::Killed => {
                job.record_failure(JobException::from_error(
                    &JobError::Killed { id: job.id.clone() }.into(),
                ));
                if job.can_retry() {
                    self.store.release(&mut job, Duration::ZERO).await?;
                    tracing::warn!(job_id = %job.id, "Job interrupted by kill, released");
                } else {
                    self.set_state(&mut job, JobState::Failed);
                    self.store.update(&job).await?;
                    tracing::error!(
                        job_id = %job.id,
                        attempts = job.attempts,
                        "Job interrupted by kill on its last attempt"
                    );
                }
                return Ok(Some(WorkerExit::Killed));
            }
        }
        Ok(None)
    }

    /// Run the handler, racing it against the job deadline and a kill request.
    async fn execute(&self, job: &Job) -> Outcome {
        let Some(handler) = self.handlers.get(&job.job_type).await else {
            return Outcome::Failure(
                JobError::NoHandler {
                    job_type: job.job_type.clone(),
                }
                .into(),
            );
        };

        let token = CancellationToken::new();
        let ctx = JobContext::new(job.clone(), token.clone());
        let work = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();

        let deadline = async {
            match job.deadline() {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };

        let mut control = self.control.clone();
        let killed = async move {
            loop {
                if *control.borrow_and_update() == WorkerSignal::Kill {
                    return;
                }
                if control.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            result = work => match result {
                Ok(Ok(())) => Outcome::Success,
                Ok(Err(e)) => Outcome::Failure(e),
                Err(_) => Outcome::Failure(anyhow::anyhow!("handler for '{}' panicked", job.job_type)),
            },
            _ = deadline => {
                token.cancel();
                Outcome::Failure(
                    JobError::Timeout {
                        id: job.id.clone(),
                        timeout: Duration::from_secs(job.timeout),
                    }
                    .into(),
                )
            }
            _ = killed => {
                token.cancel();
                Outcome::Killed
            }
        }
    }

    fn set_state(&self, job: &mut Job, target: JobState) {
        if let Err(e) = job.transition_to(target) {
            tracing::warn!(job_id = %job.id, error = %e, "Forcing job state");
            job.set_state(target);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::store::{DEFAULT_COMPRESSION_THRESHOLD, LibSqlJobStore, PayloadCodec};
    use crate::worker::handler::JobHandler;

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        fn job_type(&self) -> &str {
            "succeed"
        }
        async fn handle(&self, _ctx: JobContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFail(AtomicU32);

    #[async_trait]
    impl JobHandler for AlwaysFail {
        fn job_type(&self) -> &str {
            "fail"
        }
        async fn handle(&self, _ctx: JobContext) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    /// Ignores cancellation and sleeps far past any test deadline.
    struct Stubborn;

    #[async_trait]
    impl JobHandler for Stubborn {
        fn job_type(&self) -> &str {
            "stubborn"
        }
        async fn handle(&self, _ctx: JobContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    async fn setup() -> (Arc<dyn JobStore>, Arc<HandlerRegistry>) {
        let codec = PayloadCodec::new("worker-test", DEFAULT_COMPRESSION_THRESHOLD).unwrap();
        let store: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_memory(codec).await.unwrap());
        let handlers = Arc::new(HandlerRegistry::with_builtins());
        handlers.register(Arc::new(Succeed)).await;
        handlers.register(Arc::new(AlwaysFail(AtomicU32::new(0)))).await;
        handlers.register(Arc::new(Stubborn)).await;
        (store, handlers)
    }

    fn options(max_jobs: u64) -> WorkerOptions {
        WorkerOptions {
            max_jobs,
            idle_wait: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn worker(store: &Arc<dyn JobStore>, handlers: &Arc<HandlerRegistry>, opts: WorkerOptions) -> Worker {
        Worker::new("test-worker", "default", Arc::clone(store), Arc::clone(handlers), opts)
    }

    async fn push(store: &Arc<dyn JobStore>, job_type: &str) -> Job {
        let job = Job::new(job_type, "default", serde_json::json!({}));
        store.push(&job).await.unwrap();
        job
    }

    async fn wait_for_state(store: &Arc<dyn JobStore>, id: &str, state: JobState) -> Job {
        for _ in 0..200 {
            if let Some(job) = store.get_job_by_id(id).await.unwrap()
                && job.state == state
            {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {state}");
    }

    /// Make a released job eligible again without waiting out its backoff.
    async fn make_available(store: &Arc<dyn JobStore>, id: &str) {
        let mut job = store.get_job_by_id(id).await.unwrap().unwrap();
        job.available_at = Utc::now();
        store.update(&job).await.unwrap();
    }

    #[tokio::test]
    async fn successful_job_completes() {
        let (store, handlers) = setup().await;
        let job = push(&store, "succeed").await;

        let exit = worker(&store, &handlers, options(1)).run().await;
        assert_eq!(exit, WorkerExit::MaxJobs);

        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn failures_back_off_then_fail() {
        let (store, handlers) = setup().await;
        let job = push(&store, "fail").await;

        worker(&store, &handlers, options(1)).run().await;
        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.delay, 2);
        assert!(stored.available_at > Utc::now());
        assert_eq!(stored.exception.unwrap().message, "upstream unavailable");

        make_available(&store, &job.id).await;
        worker(&store, &handlers, options(1)).run().await;
        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.delay, 4);

        make_available(&store, &job.id).await;
        worker(&store, &handlers, options(1)).run().await;
        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 3);
        assert!(stored.failed_at.is_some());
        assert_eq!(store.get_failed_jobs(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_a_failure() {
        let (store, handlers) = setup().await;
        let job = Job::new("unknown", "default", serde_json::json!({})).with_max_attempts(1);
        store.push(&job).await.unwrap();

        worker(&store, &handlers, options(1)).run().await;
        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.exception.unwrap().message.contains("unknown"));
    }

    #[tokio::test]
    async fn deadline_interrupts_handler() {
        let (store, handlers) = setup().await;
        let job = Job::new("stubborn", "default", serde_json::json!({}))
            .with_timeout(1)
            .with_max_attempts(1);
        store.push(&job).await.unwrap();

        let start = Instant::now();
        worker(&store, &handlers, options(1)).run().await;
        assert!(start.elapsed() < Duration::from_secs(5));

        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert!(stored.exception.unwrap().message.contains("timed out"));
    }

    #[tokio::test]
    async fn recycles_after_max_jobs() {
        let (store, handlers) = setup().await;
        for _ in 0..3 {
            push(&store, "succeed").await;
        }

        let exit = worker(&store, &handlers, options(2)).run().await;
        assert_eq!(exit, WorkerExit::MaxJobs);
        assert!(exit.wants_restart());

        let stats = store.get_stats(Some("default")).await.unwrap();
        assert_eq!(stats[0].completed, 2);
        assert_eq!(stats[0].pending, 1);
    }

    #[tokio::test]
    async fn stop_before_run_exits_immediately() {
        let (store, handlers) = setup().await;
        let job = push(&store, "succeed").await;

        let worker = worker(&store, &handlers, options(0));
        worker.handle().stop();
        assert_eq!(worker.run().await, WorkerExit::Stopped);

        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
    }

    #[tokio::test]
    async fn run_timeout_exits() {
        let (store, handlers) = setup().await;
        let opts = WorkerOptions {
            run_timeout: Duration::from_millis(100),
            ..options(0)
        };
        assert_eq!(worker(&store, &handlers, opts).run().await, WorkerExit::TimedOut);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn memory_limit_exits() {
        let (store, handlers) = setup().await;
        let opts = WorkerOptions {
            memory_limit_mb: 1,
            ..options(0)
        };
        assert_eq!(worker(&store, &handlers, opts).run().await, WorkerExit::MemoryLimit);
    }

    #[tokio::test]
    async fn pause_holds_jobs_until_resume() {
        let (store, handlers) = setup().await;
        let worker = worker(&store, &handlers, options(0));
        let handle = worker.handle();
        handle.pause();
        let task = tokio::spawn(worker.run());

        let job = push(&store, "succeed").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);

        handle.resume();
        wait_for_state(&store, &job.id, JobState::Completed).await;

        handle.stop();
        assert_eq!(task.await.unwrap(), WorkerExit::Stopped);
    }

    #[tokio::test]
    async fn kill_releases_running_job() {
        let (store, handlers) = setup().await;
        let job = Job::new("sleep", "default", serde_json::json!({ "seconds": 30 }));
        store.push(&job).await.unwrap();

        let worker = worker(&store, &handlers, options(0));
        let handle = worker.handle();
        let task = tokio::spawn(worker.run());

        wait_for_state(&store, &job.id, JobState::Processing).await;
        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Killed);

        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.delay, 0);
    }

    #[tokio::test]
    async fn kill_on_last_attempt_fails_job() {
        let (store, handlers) = setup().await;
        let job = Job::new("sleep", "default", serde_json::json!({ "seconds": 30 }))
            .with_max_attempts(1);
        store.push(&job).await.unwrap();

        let worker = worker(&store, &handlers, options(0));
        let handle = worker.handle();
        let task = tokio::spawn(worker.run());

        wait_for_state(&store, &job.id, JobState::Processing).await;
        handle.kill();
        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::Killed);

        let stored = store.get_job_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Failed);
        assert_eq!(stored.attempts, 1);
        assert!(stored.failed_at.is_some());
        assert!(store.pop("default").await.unwrap().is_none());
    }
}
