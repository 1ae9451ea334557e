//! Scheduling: cron engine, natural-language phrases, and the dispatch loop.

pub mod cron;
pub mod natural;
pub mod scheduled;
pub mod scheduler;

pub use cron::{CronExpression, truncate_to_minute};
pub use natural::NaturalLanguageParser;
pub use scheduled::ScheduledJob;
pub use scheduler::{DEFAULT_CHECK_INTERVAL, JobScheduler, UpcomingRun, spawn_scheduler};
