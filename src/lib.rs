//! jobkeeper: persistent priority job queue with workers and cron scheduling.

pub mod config;
pub mod error;
pub mod job;
pub mod manager;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use config::QueueConfig;
pub use error::{Error, Result};
pub use job::{Job, JobState};
pub use manager::QueueManager;
