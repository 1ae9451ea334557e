//! Job model: the unit of work and its lifecycle.
//!
//! - `state`: state machine (Pending → Processing → Completed/Retrying/Failed)
//! - `model`: the `Job` value object, retry policy and failure capture

pub mod model;
pub mod state;

pub use model::{Job, JobException, DEFAULT_MAX_ATTEMPTS, MAX_BACKOFF_SECS};
pub use state::JobState;
