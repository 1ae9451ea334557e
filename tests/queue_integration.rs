//! End-to-end tests against an on-disk job store.
//!
//! Each test opens a fresh database in a temporary directory and drives it
//! through the public API: store, workers, scheduler and manager together.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::timeout;

use jobkeeper::error::DatabaseError;
use jobkeeper::scheduler::{CronExpression, ScheduledJob};
use jobkeeper::store::{JobStore, LibSqlJobStore, PayloadCodec, DEFAULT_COMPRESSION_THRESHOLD};
use jobkeeper::worker::{JobContext, JobHandler, WorkerExit, WorkerOptions};
use jobkeeper::{Job, JobState, QueueConfig, QueueManager};

/// Maximum time any wait is allowed before we consider the test hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

const KEY: &str = "integration-secret";

/// Records the `n` field of every payload it handles; fails when `fail` is set.
struct Recorder {
    seen: Mutex<Vec<i64>>,
}

#[async_trait]
impl JobHandler for Recorder {
    fn job_type(&self) -> &str {
        "record"
    }

    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        if ctx.payload().get("fail").is_some() {
            anyhow::bail!("asked to fail");
        }
        let n = ctx.payload()["n"].as_i64().unwrap_or(-1);
        self.seen.lock().await.push(n);
        Ok(())
    }
}

fn config(dir: &tempfile::TempDir) -> QueueConfig {
    let db_path = dir.path().join("jobs.db");
    QueueConfig::from_lookup(|key| match key {
        "JOBKEEPER_ENCRYPTION_KEY" => Some(KEY.to_string()),
        "JOBKEEPER_DB_PATH" => Some(db_path.display().to_string()),
        _ => None,
    })
    .unwrap()
}

fn fast_options() -> WorkerOptions {
    WorkerOptions {
        idle_wait: Duration::from_millis(10),
        ..Default::default()
    }
}

fn record_job(n: i64) -> Job {
    Job::new("record", "default", serde_json::json!({ "n": n }))
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(TEST_TIMEOUT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn claims_are_exclusive_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let codec = || PayloadCodec::new(KEY, DEFAULT_COMPRESSION_THRESHOLD).unwrap();

    let a: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_local(&path, codec()).await.unwrap());
    let b: Arc<dyn JobStore> = Arc::new(LibSqlJobStore::new_local(&path, codec()).await.unwrap());

    for n in 0..30 {
        a.push(&record_job(n).with_priority((n % 3) as i32)).await.unwrap();
    }

    let pollers = [&a, &b, &a, &b].into_iter().map(|store| {
        let store = Arc::clone(store);
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            let mut errors = 0;
            loop {
                match store.pop("default").await {
                    Ok(Some(job)) => claimed.push(job.id),
                    Ok(None) => break,
                    // Lock contention between connections; a worker backs off the same way.
                    Err(_) if errors < 200 => {
                        errors += 1;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    Err(e) => panic!("pop kept failing: {e}"),
                }
            }
            claimed
        })
    });

    let mut all = Vec::new();
    for claimed in futures::future::join_all(pollers).await {
        all.extend(claimed.unwrap());
    }
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 30);
    assert_eq!(unique.len(), 30);
}

#[tokio::test]
async fn workers_drain_queue_and_keep_failures() {
    let dir = tempfile::tempdir().unwrap();
    let manager = QueueManager::open(&config(&dir)).await.unwrap();
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    manager.handlers().register(recorder.clone()).await;

    for n in 0..10 {
        manager.push(record_job(n)).await.unwrap();
    }
    let failing = Job::new("record", "default", serde_json::json!({ "fail": true }))
        .with_max_attempts(1);
    let failing_id = manager.push(failing).await.unwrap();

    manager.spawn_workers("default", 2, fast_options()).await;
    let m = &manager;
    wait_until(move || async move {
        m.get_queue_stats(Some("default"))
            .await
            .unwrap()
            .first()
            .is_some_and(|s| s.completed == 10 && s.failed == 1)
    })
    .await;

    let exits = manager.shutdown().await;
    assert!(exits.iter().all(|e| *e == WorkerExit::Stopped));

    let mut seen = recorder.seen.lock().await.clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());

    let failed = manager.get_failed_jobs(None).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, failing_id);
    let exception = failed[0].exception.as_ref().unwrap();
    assert_eq!(exception.message, "asked to fail");

    assert!(manager.retry_failed_job(&failing_id).await.unwrap());
    let retried = manager.get_job_by_id(&failing_id).await.unwrap().unwrap();
    assert_eq!(retried.state, JobState::Pending);
}

#[tokio::test]
async fn payloads_are_encrypted_at_rest() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);
    let id = {
        let manager = QueueManager::open(&config).await.unwrap();
        let job = Job::new(
            "log",
            "default",
            serde_json::json!({ "message": "card number 4111-1111", "blob": "z".repeat(4096) }),
        );
        manager.push(job).await.unwrap()
    };

    let db = libsql::Builder::new_local(&config.db_path).build().await.unwrap();
    let conn = db.connect().unwrap();
    let mut rows = conn
        .query("SELECT payload FROM jobs WHERE id = ?1", libsql::params![id.clone()])
        .await
        .unwrap();
    let stored: String = rows.next().await.unwrap().unwrap().get(0).unwrap();
    assert!(!stored.contains("card number"));
    assert!(!stored.contains("\"blob\""));

    let wrong_key = QueueConfig {
        encryption_key: "not-the-key".into(),
        ..config.clone()
    };
    let manager = QueueManager::open(&wrong_key).await.unwrap();
    assert!(matches!(
        manager.get_job_by_id(&id).await,
        Err(jobkeeper::Error::Database(DatabaseError::Corrupt { .. }))
    ));
    let quarantined = manager.list_quarantined().await.unwrap();
    assert_eq!(quarantined.len(), 1);
    assert_eq!(quarantined[0].payload, stored);
}

#[tokio::test]
async fn scheduled_jobs_reach_workers() {
    let dir = tempfile::tempdir().unwrap();
    let manager = QueueManager::open(&config(&dir)).await.unwrap();
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    manager.handlers().register(recorder.clone()).await;

    let mut scheduled = ScheduledJob::new(record_job(42), CronExpression::parse("0 0 1 1 *").unwrap())
        .unwrap()
        .once();
    scheduled.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
    manager.schedule_job(scheduled).await.unwrap();

    assert_eq!(manager.scheduler().tick(Utc::now()).await, 1);
    assert!(manager.get_scheduled_jobs().await.is_empty());

    manager.spawn_workers("default", 1, fast_options()).await;
    let r = &recorder;
    wait_until(move || async move { *r.seen.lock().await == vec![42] }).await;
    manager.shutdown().await;
}

#[tokio::test]
async fn jobs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(&dir);

    let id = {
        let manager = QueueManager::open(&config).await.unwrap();
        manager
            .push(record_job(7).with_priority(Job::PRIORITY_URGENT).with_tags(["restart"]))
            .await
            .unwrap()
    };

    let manager = QueueManager::open(&config).await.unwrap();
    let job = manager.pop("default").await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.payload["n"], 7);
    assert_eq!(job.tags, vec!["restart".to_string()]);
}
