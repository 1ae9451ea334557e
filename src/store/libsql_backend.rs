//! libSQL backend: async `JobStore` implementation.
//!
//! Supports local file and in-memory databases. Claiming is a single
//! `UPDATE … RETURNING` statement, so concurrent pollers sharing the
//! database never receive the same job.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, error, info, warn};

use crate::error::DatabaseError;
use crate::job::{Job, JobException, JobState};
use crate::store::codec::PayloadCodec;
use crate::store::migrations;
use crate::store::traits::{JobStore, QuarantinedJob, QueueStats};

/// libSQL job store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlJobStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    codec: PayloadCodec,
}

impl LibSqlJobStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, codec: PayloadCodec) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db, codec).await?;
        info!(path = %path.display(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(codec: PayloadCodec) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db, codec).await
    }

    async fn from_database(db: LibSqlDatabase, codec: PayloadCodec) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Other connections may hold the write lock briefly while claiming.
        for pragma in ["PRAGMA busy_timeout = 5000", "PRAGMA journal_mode = WAL"] {
            if let Ok(mut rows) = conn.query(pragma, ()).await {
                let _ = rows.next().await;
            }
        }

        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            codec,
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Map a row (in `JOB_COLUMNS` order) to a Job, decoding the payload.
    fn row_to_job(&self, row: &libsql::Row) -> Result<Job, DatabaseError> {
        let id = text(row, 0)?;
        let payload_text = text(row, 2)?;
        let payload = self
            .codec
            .decode(&payload_text)
            .map_err(|source| DatabaseError::Corrupt {
                id: id.clone(),
                source,
            })?;

        let state: JobState = text(row, 3)?.parse().map_err(DatabaseError::Serialization)?;
        let dependencies: Vec<String> = serde_json::from_str(&text(row, 11)?)
            .map_err(|e| DatabaseError::Serialization(format!("dependencies: {e}")))?;
        let tags: Vec<String> = serde_json::from_str(&text(row, 12)?)
            .map_err(|e| DatabaseError::Serialization(format!("tags: {e}")))?;
        let exception = match opt_text(row, 17) {
            Some(s) => Some(
                serde_json::from_str::<JobException>(&s)
                    .unwrap_or_else(|_| JobException::from_message(s)),
            ),
            None => None,
        };

        Ok(Job {
            id,
            job_type: text(row, 1)?,
            payload,
            state,
            priority: int(row, 4)? as i32,
            queue: text(row, 5)?,
            attempts: int(row, 6)? as u32,
            max_attempts: int(row, 7)? as u32,
            timeout: int(row, 8)? as u64,
            delay: int(row, 9)? as u64,
            available_at: parse_datetime(&text(row, 10)?),
            dependencies,
            tags,
            created_at: parse_datetime(&text(row, 13)?),
            updated_at: parse_datetime(&text(row, 14)?),
            failed_at: opt_text(row, 15).map(|s| parse_datetime(&s)),
            completed_at: opt_text(row, 16).map(|s| parse_datetime(&s)),
            exception,
        })
    }

    /// Drain job rows, quarantining any whose payload cannot be decoded.
    async fn collect_jobs(
        &self,
        mut rows: libsql::Rows,
        op: &str,
    ) -> Result<Vec<Job>, DatabaseError> {
        let mut jobs = Vec::new();
        let mut corrupt = Vec::new();

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
        {
            match self.row_to_job(&row) {
                Ok(job) => jobs.push(job),
                Err(e) => match unreadable_row(&row, &e) {
                    Some(bad) => corrupt.push(bad),
                    None => return Err(e),
                },
            }
        }
        drop(rows);

        for (id, reason) in corrupt {
            warn!(job_id = %id, op, "Unreadable job row left out of results");
            self.quarantine(&id, &reason).await?;
        }
        Ok(jobs)
    }

    /// Move an unreadable row out of `jobs` into `job_quarantine`.
    async fn quarantine(&self, id: &str, reason: &str) -> Result<(), DatabaseError> {
        error!(job_id = %id, reason = %reason, "Stored job row is unreadable; quarantining row");

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine begin: {e}")))?;

        tx.execute(
            "INSERT OR REPLACE INTO job_quarantine (id, queue_name, job_type, payload, reason, quarantined_at)
             SELECT id, queue_name, job_type, payload, ?2, ?3 FROM jobs WHERE id = ?1",
            params![id, reason, ts(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("quarantine insert: {e}")))?;

        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine delete: {e}")))?;

        // Dropping `tx` on an error above rolls both statements back.
        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("quarantine commit: {e}")))?;
        Ok(())
    }

    /// Run a single-row job query, quarantining and retrying past corrupt rows.
    async fn first_job(
        &self,
        sql: &str,
        queue: &str,
        op: &str,
    ) -> Result<Option<Job>, DatabaseError> {
        loop {
            let now = ts(&Utc::now());
            let mut rows = self
                .conn()
                .query(sql, params![queue, now])
                .await
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

            let row = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;
            let Some(row) = row else {
                return Ok(None);
            };

            match self.row_to_job(&row) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    let Some((id, reason)) = unreadable_row(&row, &e) else {
                        return Err(e);
                    };
                    drop(rows);
                    self.quarantine(&id, &reason).await?;
                }
            }
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Completion time before which completed jobs are removed.
pub(crate) fn retention_cutoff(now: DateTime<Utc>, hours: u64) -> Option<DateTime<Utc>> {
    let hours = i64::try_from(hours).ok()?;
    now.checked_sub_signed(chrono::TimeDelta::try_hours(hours)?)
}

/// Id and reason for a row that cannot be turned into a `Job`.
///
/// `None` means the error is not about the row's contents.
fn unreadable_row(row: &libsql::Row, err: &DatabaseError) -> Option<(String, String)> {
    match err {
        DatabaseError::Corrupt { id, source } => Some((id.clone(), source.to_string())),
        DatabaseError::Serialization(reason) => text(row, 0).ok().map(|id| (id, reason.clone())),
        _ => None,
    }
}

/// Canonical timestamp format. Fixed width, so text order is time order.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn opt_text(row: &libsql::Row, idx: i32) -> Option<String> {
    row.get::<String>(idx).ok()
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

/// Convert `Option<DateTime>` to a libsql Value.
fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(&dt)),
        None => libsql::Value::Null,
    }
}

fn queue_filter(queue: Option<&str>) -> libsql::Value {
    match queue {
        Some(q) => libsql::Value::Text(q.to_string()),
        None => libsql::Value::Null,
    }
}

fn exception_json(job: &Job) -> Result<libsql::Value, DatabaseError> {
    match &job.exception {
        Some(exc) => serde_json::to_string(exc)
            .map(libsql::Value::Text)
            .map_err(|e| DatabaseError::Serialization(e.to_string())),
        None => Ok(libsql::Value::Null),
    }
}

fn list_json(items: &[String]) -> Result<String, DatabaseError> {
    serde_json::to_string(items).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

// ── Trait implementation ────────────────────────────────────────────

const JOB_COLUMNS: &str = "id, job_type, payload, state, priority, queue_name, attempts, max_attempts, timeout_seconds, delay_seconds, available_at, dependencies, tags, created_at, updated_at, failed_at, completed_at, exception";

#[async_trait]
impl JobStore for LibSqlJobStore {
    async fn push(&self, job: &Job) -> Result<(), DatabaseError> {
        job.validate()
            .map_err(|e| DatabaseError::Constraint(e.to_string()))?;

        let payload = self
            .codec
            .encode(&job.payload)
            .map_err(|e| DatabaseError::Serialization(format!("payload: {e}")))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    job.id.clone(),
                    job.job_type.clone(),
                    payload,
                    job.state.as_str(),
                    job.priority as i64,
                    job.queue.clone(),
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.timeout as i64,
                    job.delay as i64,
                    ts(&job.available_at),
                    list_json(&job.dependencies)?,
                    list_json(&job.tags)?,
                    ts(&job.created_at),
                    ts(&job.updated_at),
                    opt_ts(job.failed_at),
                    opt_ts(job.completed_at),
                    exception_json(job)?,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("push: {e}")))?;

        debug!(job_id = %job.id, queue = %job.queue, priority = job.priority, "Job pushed");
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<Job>, DatabaseError> {
        let sql = format!(
            "UPDATE jobs SET state = 'processing', updated_at = ?2
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE queue_name = ?1 AND state = 'pending' AND available_at <= ?2
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT 1
             ) AND state = 'pending'
             RETURNING {JOB_COLUMNS}"
        );
        let job = self.first_job(&sql, queue, "pop").await?;
        if let Some(ref job) = job {
            debug!(job_id = %job.id, queue = %queue, "Job claimed");
        }
        Ok(job)
    }

    async fn peek(&self, queue: &str) -> Result<Option<Job>, DatabaseError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs
             WHERE queue_name = ?1 AND state = 'pending' AND available_at <= ?2
             ORDER BY priority DESC, created_at ASC, rowid ASC
             LIMIT 1"
        );
        self.first_job(&sql, queue, "peek").await
    }

    async fn delete(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete: {e}")))?;
        Ok(count > 0)
    }

    async fn update(&self, job: &Job) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET state=?1, priority=?2, attempts=?3, max_attempts=?4, timeout_seconds=?5, delay_seconds=?6, available_at=?7, dependencies=?8, tags=?9, updated_at=?10, failed_at=?11, completed_at=?12, exception=?13 WHERE id=?14",
                params![
                    job.state.as_str(),
                    job.priority as i64,
                    job.attempts as i64,
                    job.max_attempts as i64,
                    job.timeout as i64,
                    job.delay as i64,
                    ts(&job.available_at),
                    list_json(&job.dependencies)?,
                    list_json(&job.tags)?,
                    ts(&job.updated_at),
                    opt_ts(job.failed_at),
                    opt_ts(job.completed_at),
                    exception_json(job)?,
                    job.id.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "job".into(),
                id: job.id.clone(),
            });
        }
        debug!(job_id = %job.id, state = %job.state, "Job updated");
        Ok(())
    }

    async fn release(&self, job: &mut Job, delay: Duration) -> Result<(), DatabaseError> {
        let offset = chrono::Duration::from_std(delay)
            .map_err(|e| DatabaseError::Constraint(format!("release delay: {e}")))?;
        job.transition_to(JobState::Pending)
            .map_err(|e| DatabaseError::Constraint(e.to_string()))?;
        job.delay = delay.as_secs();
        job.available_at = job
            .updated_at
            .checked_add_signed(offset)
            .ok_or_else(|| DatabaseError::Constraint("release delay out of range".into()))?;
        self.update(job).await?;

        debug!(job_id = %job.id, delay_secs = job.delay, "Job released");
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE jobs SET state = 'cancelled', updated_at = ?2 WHERE id = ?1 AND state IN ('pending', 'retrying')",
                params![id, ts(&Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel: {e}")))?;

        if count > 0 {
            info!(job_id = %id, "Job cancelled");
        }
        Ok(count > 0)
    }

    async fn purge(&self, queue: &str) -> Result<u64, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM jobs WHERE queue_name = ?1", params![queue])
            .await
            .map_err(|e| DatabaseError::Query(format!("purge: {e}")))?;

        info!(queue = %queue, count, "Queue purged");
        Ok(count)
    }

    async fn get_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'failed' AND (?1 IS NULL OR queue_name = ?1) ORDER BY updated_at DESC"
                ),
                params![queue_filter(queue)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_failed_jobs: {e}")))?;
        self.collect_jobs(rows, "get_failed_jobs").await
    }

    async fn get_jobs_by_state(
        &self,
        state: JobState,
        queue: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 AND (?2 IS NULL OR queue_name = ?2) ORDER BY updated_at DESC LIMIT ?3"
                ),
                params![state.as_str(), queue_filter(queue), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_jobs_by_state: {e}")))?;
        self.collect_jobs(rows, "get_jobs_by_state").await
    }

    async fn get_job_by_id(&self, id: &str) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_id: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_job_by_id: {e}")))?;
        let Some(row) = row else {
            return Ok(None);
        };

        match self.row_to_job(&row) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                if let Some((id, reason)) = unreadable_row(&row, &e) {
                    drop(rows);
                    self.quarantine(&id, &reason).await?;
                }
                Err(e)
            }
        }
    }

    async fn get_stats(&self, queue: Option<&str>) -> Result<Vec<QueueStats>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT queue_name, COUNT(*),
                    SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'processing' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'completed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'retrying' THEN 1 ELSE 0 END),
                    SUM(CASE WHEN state = 'cancelled' THEN 1 ELSE 0 END),
                    AVG(priority), MIN(created_at), MAX(created_at)
                 FROM jobs
                 WHERE (?1 IS NULL OR queue_name = ?1)
                 GROUP BY queue_name
                 ORDER BY queue_name",
                params![queue_filter(queue)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_stats: {e}")))?;

        let mut stats = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_stats: {e}")))?
        {
            let count = |idx: i32| row.get::<i64>(idx).unwrap_or(0) as u64;
            stats.push(QueueStats {
                queue: text(&row, 0)?,
                total_jobs: count(1),
                pending: count(2),
                processing: count(3),
                completed: count(4),
                failed: count(5),
                retrying: count(6),
                cancelled: count(7),
                average_priority: row.get::<f64>(8).unwrap_or(0.0),
                oldest_created_at: opt_text(&row, 9).map(|s| parse_datetime(&s)),
                newest_created_at: opt_text(&row, 10).map(|s| parse_datetime(&s)),
            });
        }
        Ok(stats)
    }

    async fn cleanup_old_completed_jobs(&self, hours_old: u64) -> Result<u64, DatabaseError> {
        let cutoff = retention_cutoff(Utc::now(), hours_old).ok_or_else(|| {
            DatabaseError::Constraint(format!("retention of {hours_old} hours is out of range"))
        })?;
        let count = self
            .conn()
            .execute(
                "DELETE FROM jobs WHERE state = 'completed' AND completed_at < ?1",
                params![ts(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup_old_completed_jobs: {e}")))?;

        if count > 0 {
            info!(count, hours_old, "Removed old completed jobs");
        }
        Ok(count)
    }

    async fn list_quarantined(&self) -> Result<Vec<QuarantinedJob>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, queue_name, job_type, payload, reason, quarantined_at FROM job_quarantine ORDER BY quarantined_at DESC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_quarantined: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_quarantined: {e}")))?
        {
            out.push(QuarantinedJob {
                id: text(&row, 0)?,
                queue: text(&row, 1)?,
                job_type: text(&row, 2)?,
                payload: text(&row, 3)?,
                reason: text(&row, 4)?,
                quarantined_at: parse_datetime(&text(&row, 5)?),
            });
        }
        Ok(out)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
