//! Worker system: job execution against the store.
//!
//! Core components:
//! - `handler`: `JobHandler` trait and the registry keyed by job type
//! - `builtin`: built-in handlers (`log`, `sleep`)
//! - `control`: stop / pause / resume / kill over a watch channel
//! - `resources`: process memory probe used for recycling
//! - `worker`: the polling execution loop

pub mod builtin;
pub mod control;
pub mod handler;
pub mod resources;
pub mod worker;

pub use control::{WorkerHandle, WorkerSignal};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use worker::{Worker, WorkerExit, WorkerOptions};
