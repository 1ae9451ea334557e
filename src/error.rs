//! Error types for jobkeeper.

use std::time::Duration;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors. Surfaced to callers unmodified.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Stored payload for job {id} is unreadable: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: CodecError,
    },
}

/// Payload encryption / compression errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Encryption key must not be empty")]
    EmptyKey,

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed (wrong key or tampered payload)")]
    Decrypt,

    #[error("Encrypted payload too short: {len} bytes")]
    Truncated { len: usize },

    #[error("Base64 decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Compression failed: {0}")]
    Compression(#[from] std::io::Error),

    #[error("Payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Payload JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: String,
        state: String,
        target: String,
    },

    #[error("No handler registered for job type '{job_type}'")]
    NoHandler { job_type: String },

    #[error("Job {id} timed out after {timeout:?}")]
    Timeout { id: String, timeout: Duration },

    #[error("Job {id} was interrupted by a kill request")]
    Killed { id: String },
}

/// Scheduling errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Could not understand schedule '{0}'")]
    Unparseable(String),

    #[error("No run of '{expression}' within {days} days")]
    NoUpcomingRun { expression: String, days: i64 },
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
