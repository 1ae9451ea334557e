//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;

use crate::error::ConfigError;
use crate::store::DEFAULT_COMPRESSION_THRESHOLD;
use crate::store::libsql_backend::retention_cutoff;
use crate::worker::WorkerOptions;

/// Deployment configuration for the queue daemon.
#[derive(Clone)]
pub struct QueueConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Queue the workers consume.
    pub queue: String,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Run time before a worker is recycled (0 = unbounded).
    pub worker_timeout: Duration,
    /// Resident memory above which a worker is recycled (0 = unbounded).
    pub memory_limit_mb: u64,
    /// Jobs a worker processes before it is recycled (0 = unbounded).
    pub max_jobs: u64,
    /// Scheduler dispatch interval.
    pub check_interval: Duration,
    /// Passphrase for payload encryption.
    pub encryption_key: String,
    /// Payload JSON size above which payloads are compressed.
    pub compression_threshold: usize,
    /// Completed jobs are kept this many hours.
    pub retention_hours: u64,
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("db_path", &self.db_path)
            .field("queue", &self.queue)
            .field("workers", &self.workers)
            .field("worker_timeout", &self.worker_timeout)
            .field("memory_limit_mb", &self.memory_limit_mb)
            .field("max_jobs", &self.max_jobs)
            .field("check_interval", &self.check_interval)
            .field("encryption_key", &"[REDACTED]")
            .field("compression_threshold", &self.compression_threshold)
            .field("retention_hours", &self.retention_hours)
            .finish()
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobkeeper.db"),
            queue: "default".to_string(),
            workers: 1,
            worker_timeout: Duration::from_secs(3600), // 1 hour
            memory_limit_mb: 128,
            max_jobs: 1000,
            check_interval: Duration::from_secs(60), // 1 minute
            encryption_key: String::new(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            retention_hours: 1,
        }
    }
}

impl QueueConfig {
    /// Build config from `JOBKEEPER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let encryption_key = lookup("JOBKEEPER_ENCRYPTION_KEY")
            .filter(|k| !k.is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("JOBKEEPER_ENCRYPTION_KEY".into()))?;

        let db_path = lookup("JOBKEEPER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let queue = lookup("JOBKEEPER_QUEUE").unwrap_or(defaults.queue);
        if queue.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "JOBKEEPER_QUEUE".into(),
                message: "queue name must not be empty".into(),
            });
        }

        let workers: usize = parse(&lookup, "JOBKEEPER_WORKERS", defaults.workers)?;
        if workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOBKEEPER_WORKERS".into(),
                message: "at least one worker is required".into(),
            });
        }

        let worker_timeout_secs = parse(
            &lookup,
            "JOBKEEPER_WORKER_TIMEOUT_SECS",
            defaults.worker_timeout.as_secs(),
        )?;
        let check_interval_secs = parse(
            &lookup,
            "JOBKEEPER_CHECK_INTERVAL_SECS",
            defaults.check_interval.as_secs(),
        )?;
        if check_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOBKEEPER_CHECK_INTERVAL_SECS".into(),
                message: "interval must be at least 1 second".into(),
            });
        }

        let retention_hours =
            parse(&lookup, "JOBKEEPER_RETENTION_HOURS", defaults.retention_hours)?;
        if retention_cutoff(Utc::now(), retention_hours).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "JOBKEEPER_RETENTION_HOURS".into(),
                message: format!("{retention_hours} hours is out of range"),
            });
        }

        Ok(Self {
            db_path,
            queue,
            workers,
            worker_timeout: Duration::from_secs(worker_timeout_secs),
            memory_limit_mb: parse(&lookup, "JOBKEEPER_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            max_jobs: parse(&lookup, "JOBKEEPER_MAX_JOBS", defaults.max_jobs)?,
            check_interval: Duration::from_secs(check_interval_secs),
            encryption_key,
            compression_threshold: parse(
                &lookup,
                "JOBKEEPER_COMPRESSION_THRESHOLD",
                defaults.compression_threshold,
            )?,
            retention_hours,
        })
    }

    /// Worker options derived from this config.
    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            run_timeout: self.worker_timeout,
            memory_limit_mb: self.memory_limit_mb,
            max_jobs: self.max_jobs,
            retention_hours: self.retention_hours,
            ..Default::default()
        }
    }
}

fn parse<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_with_key() {
        let config =
            QueueConfig::from_lookup(lookup(&[("JOBKEEPER_ENCRYPTION_KEY", "secret")])).unwrap();
        assert_eq!(config.queue, "default");
        assert_eq!(config.workers, 1);
        assert_eq!(config.compression_threshold, 1024);
        assert_eq!(config.retention_hours, 1);
        assert_eq!(config.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn missing_key_is_an_error() {
        let err = QueueConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(k) if k == "JOBKEEPER_ENCRYPTION_KEY"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = QueueConfig::from_lookup(lookup(&[
            ("JOBKEEPER_ENCRYPTION_KEY", "secret"),
            ("JOBKEEPER_QUEUE", "mail"),
            ("JOBKEEPER_WORKERS", "4"),
            ("JOBKEEPER_WORKER_TIMEOUT_SECS", "0"),
            ("JOBKEEPER_MAX_JOBS", " 50 "),
            ("JOBKEEPER_DB_PATH", "/tmp/q.db"),
        ]))
        .unwrap();
        assert_eq!(config.queue, "mail");
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_jobs, 50);
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));

        let opts = config.worker_options();
        assert!(opts.run_timeout.is_zero());
        assert_eq!(opts.max_jobs, 50);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let err = QueueConfig::from_lookup(lookup(&[
            ("JOBKEEPER_ENCRYPTION_KEY", "secret"),
            ("JOBKEEPER_WORKERS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "JOBKEEPER_WORKERS"));
    }

    #[test]
    fn absurd_retention_is_rejected() {
        let err = QueueConfig::from_lookup(lookup(&[
            ("JOBKEEPER_ENCRYPTION_KEY", "secret"),
            ("JOBKEEPER_RETENTION_HOURS", "10000000000000"),
        ]))
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { key, .. } if key == "JOBKEEPER_RETENTION_HOURS")
        );
    }

    #[test]
    fn debug_redacts_key() {
        let config =
            QueueConfig::from_lookup(lookup(&[("JOBKEEPER_ENCRYPTION_KEY", "hunter2")])).unwrap();
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
